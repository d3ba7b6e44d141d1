//! Scale-up decisions.

/// What the capacity controller should do about a shortfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleUpPlan {
    /// A previous increment has not registered yet; leave capacity alone.
    AlreadyScaling,
    /// Raise desired capacity from `from` to `to` (always `from + 1`).
    Increment { from: u32, to: u32 },
    /// The pool is at its configured maximum; an increment would be rejected.
    AtMaxSize { max_size: u32 },
}

/// Decide whether a capacity shortfall warrants another node.
///
/// `desired > registered` means an earlier increment is still in flight
/// (launching, booting, or registering), so a burst of concurrent placement
/// failures collapses into one extra node rather than one per failure.
pub fn decide_scale_up(desired: u32, registered: u32, max_size: Option<u32>) -> ScaleUpPlan {
    if desired > registered {
        return ScaleUpPlan::AlreadyScaling;
    }

    if let Some(max_size) = max_size {
        if desired >= max_size {
            return ScaleUpPlan::AtMaxSize { max_size };
        }
    }

    ScaleUpPlan::Increment {
        from: desired,
        to: desired.saturating_add(1),
    }
}
