//! Phase-2 lifetime bounds and normalization
//!
//! Every rule carries hard, soft and idle lifetimes in seconds plus hard and
//! soft lifetimes in kilobytes. [`normalize_lifetimes`] brings any tuple into
//! a consistent shape in two stages: seconds first, then kilobytes derived
//! from the settled seconds values.
//!
//! After normalization:
//!
//! ```text
//! MIN_HARD_SECS <= hard <= MAX_SECS          MIN_HARD_KB <= hard_kb <= MAX_KB
//! MIN_SOFT_SECS <= soft <= hard              MIN_SOFT_KB <= soft_kb <= hard_kb
//! MIN_IDLE_SECS <= idle,  soft - idle >= MINDIFF_SECS
//! hard != soft  =>  hard - soft >= MINDIFF_SECS,  hard_kb - soft_kb >= MINDIFF_KB
//! ```
//!
//! `soft == hard` disables soft expiry; the kilobyte pair then follows suit.

use tracing::debug;

use crate::pfkey::message::Ecomb;

/// Smallest hard lifetime, seconds
pub const MIN_P2_LIFETIME_HARD_SECS: u32 = 60;
/// Smallest soft lifetime, seconds
pub const MIN_P2_LIFETIME_SOFT_SECS: u32 = 40;
/// Smallest idle lifetime, seconds
pub const MIN_P2_LIFETIME_IDLE_SECS: u32 = 30;
/// Minimum gap between hard and soft, and between soft and idle, seconds
pub const MINDIFF_SECS: u32 = 10;
/// Largest lifetime, seconds (one week)
pub const MAX_P2_LIFETIME_SECS: u32 = 604_800;
/// Hard lifetime used when none is configured
pub const DEF_P2_LIFETIME_HARD: u32 = 3600;
/// Soft lifetime matching the default hard lifetime
pub const DEF_P2_LIFETIME_SOFT: u32 = DEF_P2_LIFETIME_HARD / 10 * 9;
/// Kilobytes per second of lifetime when deriving byte lifetimes
pub const SECS_TO_KB: u32 = 1024;
/// Smallest hard lifetime, kilobytes
pub const MIN_P2_LIFETIME_HARD_KB: u32 = 2560;
/// Smallest soft lifetime, kilobytes
pub const MIN_P2_LIFETIME_SOFT_KB: u32 = 2048;
/// Minimum gap between hard and soft, kilobytes
pub const MINDIFF_KB: u32 = 256;
/// Largest lifetime, kilobytes
pub const MAX_P2_LIFETIME_KB: u32 = 1 << 30;

/// Phase-2 lifetimes of a rule or a negotiated SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct P2Lifetimes {
    /// Hard expiry, seconds
    pub hard_secs: u32,
    /// Soft expiry, seconds
    pub soft_secs: u32,
    /// Idle expiry, seconds
    pub idle_secs: u32,
    /// Hard expiry, kilobytes
    pub hard_kb: u32,
    /// Soft expiry, kilobytes
    pub soft_kb: u32,
}

impl P2Lifetimes {
    /// Lifetimes with only the hard limits set; the rest is derived
    pub fn hard(secs: u32, kb: u32) -> Self {
        Self {
            hard_secs: secs,
            hard_kb: kb,
            ..Self::default()
        }
    }

    /// The fully-derived default tuple
    pub fn defaults() -> Self {
        normalize_lifetimes(Self::default())
    }

    /// Whether soft expiry is disabled
    pub fn soft_disabled(&self) -> bool {
        self.soft_secs == self.hard_secs
    }
}

fn ninety_percent(value: u32) -> u32 {
    (u64::from(value) * 9 / 10) as u32
}

fn secs_to_kb(secs: u32) -> u32 {
    (u64::from(secs) * u64::from(SECS_TO_KB)).min(u64::from(u32::MAX)) as u32
}

fn idle_from_soft(soft: u32) -> u32 {
    ((u64::from(soft) * 5 / 9) as u32).max(MIN_P2_LIFETIME_IDLE_SECS)
}

fn keep_apart(high: u32, low: &mut u32, mindiff: u32) {
    if high.saturating_sub(*low) < mindiff {
        *low = high - mindiff;
    }
}

/// Bring a lifetime tuple within bounds
///
/// Pure and idempotent. Zero means "unset" for every field.
pub fn normalize_lifetimes(input: P2Lifetimes) -> P2Lifetimes {
    let mut lt = input;

    // Seconds
    if lt.hard_secs == 0 {
        lt.hard_secs = DEF_P2_LIFETIME_HARD;
    }
    lt.hard_secs = lt
        .hard_secs
        .clamp(MIN_P2_LIFETIME_HARD_SECS, MAX_P2_LIFETIME_SECS);

    if lt.soft_secs != 0 {
        lt.soft_secs = lt
            .soft_secs
            .clamp(MIN_P2_LIFETIME_SOFT_SECS, MAX_P2_LIFETIME_SECS);
    }
    if lt.soft_secs != lt.hard_secs {
        if lt.soft_secs == 0 || lt.soft_secs > lt.hard_secs {
            lt.soft_secs = ninety_percent(lt.hard_secs);
        }
        keep_apart(lt.hard_secs, &mut lt.soft_secs, MINDIFF_SECS);
    }

    if lt.idle_secs != 0 && lt.idle_secs < MIN_P2_LIFETIME_IDLE_SECS {
        lt.idle_secs = MIN_P2_LIFETIME_IDLE_SECS;
    }
    if lt.idle_secs == 0 || lt.idle_secs > lt.soft_secs {
        lt.idle_secs = idle_from_soft(lt.soft_secs);
    }
    keep_apart(lt.soft_secs, &mut lt.idle_secs, MINDIFF_SECS);

    // Kilobytes
    if lt.hard_kb == 0 {
        lt.hard_kb = secs_to_kb(lt.hard_secs);
        lt.soft_kb = 0;
    }
    lt.hard_kb = lt.hard_kb.clamp(MIN_P2_LIFETIME_HARD_KB, MAX_P2_LIFETIME_KB);

    if lt.soft_kb != 0 && lt.soft_kb < MIN_P2_LIFETIME_SOFT_KB {
        lt.soft_kb = 0;
    }
    if lt.soft_disabled() {
        lt.soft_kb = lt.hard_kb;
    } else {
        if lt.soft_kb == 0 {
            // Keep the configured hard:soft proportion when hard_kb was set
            lt.soft_kb = if lt.hard_kb != secs_to_kb(DEF_P2_LIFETIME_HARD) {
                ninety_percent(lt.hard_kb)
            } else {
                secs_to_kb(lt.soft_secs)
            };
        }
        if lt.soft_kb > lt.hard_kb {
            lt.soft_kb = ninety_percent(lt.hard_kb);
        }
        keep_apart(lt.hard_kb, &mut lt.soft_kb, MINDIFF_KB);
    }

    if lt != input {
        debug!(
            hard = lt.hard_secs,
            soft = lt.soft_secs,
            idle = lt.idle_secs,
            hard_kb = lt.hard_kb,
            soft_kb = lt.soft_kb,
            "Phase 2 lifetimes adjusted"
        );
    }
    lt
}

/// Adopt the kernel's lifetimes from an ACQUIRE combination
///
/// Only values still at their defaults (or unset) are replaced. A soft
/// lifetime follows a replaced hard lifetime when the kernel offers none.
/// The result is normalized again.
pub fn adopt_acquire_lifetimes(rule: P2Lifetimes, comb: &Ecomb) -> P2Lifetimes {
    let defaults = P2Lifetimes::defaults();
    let mut lt = rule;

    let at_default = |value: u32, default: u32| value == 0 || value == default;
    let narrow = |value: u64| value.min(u64::from(u32::MAX)) as u32;

    let mut hard_secs_updated = false;
    if at_default(lt.hard_secs, defaults.hard_secs) && comb.hard_addtime != 0 {
        lt.hard_secs = narrow(comb.hard_addtime);
        hard_secs_updated = true;
    }
    if hard_secs_updated || at_default(lt.soft_secs, defaults.soft_secs) {
        if comb.soft_addtime != 0 {
            lt.soft_secs = narrow(comb.soft_addtime);
        } else if hard_secs_updated {
            lt.soft_secs = ninety_percent(lt.hard_secs);
        }
    }

    let hard_kb = comb.hard_bytes >> 10;
    let soft_kb = comb.soft_bytes >> 10;
    let mut hard_kb_updated = false;
    if at_default(lt.hard_kb, defaults.hard_kb) && hard_kb != 0 {
        lt.hard_kb = narrow(hard_kb);
        hard_kb_updated = true;
    }
    if hard_kb_updated || at_default(lt.soft_kb, defaults.soft_kb) {
        if soft_kb != 0 {
            lt.soft_kb = narrow(soft_kb);
        } else if hard_kb_updated {
            lt.soft_kb = ninety_percent(lt.hard_kb);
        }
    }

    normalize_lifetimes(lt)
}

/// Smaller of two lifetimes where 0 means "no limit"
pub fn lesser_of(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}
