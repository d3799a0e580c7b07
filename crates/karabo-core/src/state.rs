//! Device states and their reduction.
//!
//! States form a forest: every state has at most one parent and
//! [`State::is_derived_from`] walks the parent chain. The three roots are
//! `UNKNOWN`, `KNOWN` and `INIT`.
//!
//! [`StateSignifier`] reduces a set of states (e.g. of several motors behind
//! one device) to the single state that matters most.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::Value;

macro_rules! define_states {
    ($($variant:ident => $parent:expr),+ $(,)?) => {
        /// A device state.
        #[allow(missing_docs, non_camel_case_types, clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum State {
            $($variant),+
        }

        impl State {
            /// Every state, in declaration order.
            pub const ALL: &'static [State] = &[$(State::$variant),+];

            /// Canonical upper case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(State::$variant => stringify!($variant)),+
                }
            }

            /// Direct parent, `None` for roots.
            pub fn parent(self) -> Option<State> {
                match self {
                    $(State::$variant => $parent),+
                }
            }
        }
    };
}

define_states! {
    UNKNOWN => None,
    KNOWN => None,
    INIT => None,

    DISABLED => Some(State::KNOWN),
    ERROR => Some(State::KNOWN),
    NORMAL => Some(State::KNOWN),

    INTERLOCKED => Some(State::DISABLED),
    PAUSED => Some(State::DISABLED),
    IGNORING => Some(State::DISABLED),

    STATIC => Some(State::NORMAL),
    CHANGING => Some(State::NORMAL),
    RUNNING => Some(State::NORMAL),

    PASSIVE => Some(State::STATIC),
    ACTIVE => Some(State::STATIC),

    WARM => Some(State::PASSIVE),
    COLD => Some(State::PASSIVE),
    PRESSURIZED => Some(State::PASSIVE),
    OPENED => Some(State::PASSIVE),
    OFF => Some(State::PASSIVE),
    INSERTED => Some(State::PASSIVE),
    STOPPED => Some(State::PASSIVE),
    UNLOCKED => Some(State::PASSIVE),
    DISENGAGED => Some(State::PASSIVE),

    COOLED => Some(State::ACTIVE),
    HEATED => Some(State::ACTIVE),
    EVACUATED => Some(State::ACTIVE),
    CLOSED => Some(State::ACTIVE),
    ON => Some(State::ACTIVE),
    EXTRACTED => Some(State::ACTIVE),
    STARTED => Some(State::ACTIVE),
    LOCKED => Some(State::ACTIVE),
    ENGAGED => Some(State::ACTIVE),

    DECREASING => Some(State::CHANGING),
    INCREASING => Some(State::CHANGING),
    MOVING => Some(State::CHANGING),
    ROTATING => Some(State::CHANGING),
    SWITCHING => Some(State::CHANGING),

    COOLING => Some(State::DECREASING),
    RAMPING_DOWN => Some(State::DECREASING),
    EXTRACTING => Some(State::DECREASING),
    STOPPING => Some(State::DECREASING),
    EMPTYING => Some(State::DECREASING),
    OPENING => Some(State::DECREASING),

    HEATING => Some(State::INCREASING),
    RAMPING_UP => Some(State::INCREASING),
    INSERTING => Some(State::INCREASING),
    STARTING => Some(State::INCREASING),
    FILLING => Some(State::INCREASING),
    CLOSING => Some(State::INCREASING),

    MOVING_LEFT => Some(State::MOVING),
    MOVING_RIGHT => Some(State::MOVING),
    MOVING_UP => Some(State::MOVING),
    MOVING_DOWN => Some(State::MOVING),
    MOVING_FORWARD => Some(State::MOVING),
    MOVING_BACK => Some(State::MOVING),

    ROTATING_CLK => Some(State::ROTATING),
    ROTATING_CNTCLK => Some(State::ROTATING),

    SWITCHING_ON => Some(State::SWITCHING),
    SWITCHING_OFF => Some(State::SWITCHING),

    ACQUIRING => Some(State::RUNNING),
    PROCESSING => Some(State::RUNNING),
    MONITORING => Some(State::RUNNING),
}

impl State {
    /// True if `self == ancestor` or `ancestor` is on the parent chain.
    pub fn is_derived_from(self, ancestor: State) -> bool {
        let mut current = Some(self);
        while let Some(state) = current {
            if state == ancestor {
                return true;
            }
            current = state.parent();
        }
        false
    }

    /// The state itself followed by all of its ancestors.
    pub fn lineage(self) -> impl Iterator<Item = State> {
        std::iter::successors(Some(self), |s| s.parent())
    }

    /// Lookup by canonical name.
    pub fn from_name(name: &str) -> Option<State> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for State {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::from_name(s).ok_or_else(|| CoreError::InvalidState(s.to_string()))
    }
}

impl From<State> for Value {
    fn from(state: State) -> Self {
        Value::String(state.name().to_string())
    }
}

// =============================================================================
// StateSignifier
// =============================================================================

/// Picks the most significant state of a list.
///
/// Each state is ranked by the position of its nearest lineage member in the
/// trump list (later entries win, states outside every listed lineage rank
/// lowest). On equal rank an ancestor beats its descendant, and unrelated
/// states fall back to the default ordering.
#[derive(Debug, Clone)]
pub struct StateSignifier {
    trump_list: Vec<State>,
    fallback: Vec<State>,
}

impl Default for StateSignifier {
    fn default() -> Self {
        Self::new(State::PASSIVE, State::DECREASING)
    }
}

impl StateSignifier {
    /// Default ordering with the given preferences.
    ///
    /// `static_more_significant` is `PASSIVE` or `ACTIVE`,
    /// `changing_more_significant` is `DECREASING` or `INCREASING`.
    pub fn new(static_more_significant: State, changing_more_significant: State) -> Self {
        let list = default_trump_list(static_more_significant, changing_more_significant);
        Self {
            trump_list: list.clone(),
            fallback: list,
        }
    }

    /// Custom ordering, least significant first.
    pub fn with_trump_list(trump_list: Vec<State>) -> Self {
        Self {
            trump_list,
            fallback: default_trump_list(State::PASSIVE, State::DECREASING),
        }
    }

    /// The active trump list.
    pub fn trump_list(&self) -> &[State] {
        &self.trump_list
    }

    /// Most significant member of `states`, `None` for an empty list.
    pub fn most_significant(&self, states: &[State]) -> Option<State> {
        let mut iter = states.iter().copied();
        let mut best = iter.next()?;
        for candidate in iter {
            if self.beats(candidate, best) {
                best = candidate;
            }
        }
        Some(best)
    }

    fn beats(&self, candidate: State, current: State) -> bool {
        let (rc, rb) = (rank(&self.trump_list, candidate), rank(&self.trump_list, current));
        if rc != rb {
            return rc > rb;
        }
        if current.is_derived_from(candidate) {
            return candidate != current;
        }
        if candidate.is_derived_from(current) {
            return false;
        }
        rank(&self.fallback, candidate) > rank(&self.fallback, current)
    }
}

fn default_trump_list(static_pref: State, changing_pref: State) -> Vec<State> {
    let mut list = vec![State::DISABLED];
    if static_pref == State::ACTIVE {
        list.extend([State::PASSIVE, State::ACTIVE]);
    } else {
        list.extend([State::ACTIVE, State::PASSIVE]);
    }
    list.extend([State::STATIC, State::RUNNING, State::PAUSED, State::CHANGING]);
    if changing_pref == State::INCREASING {
        list.extend([State::DECREASING, State::INCREASING]);
    } else {
        list.extend([State::INCREASING, State::DECREASING]);
    }
    list.extend([State::INTERLOCKED, State::ERROR, State::INIT, State::UNKNOWN]);
    list
}

/// One-based position of the nearest lineage member, 0 if none is listed.
fn rank(list: &[State], state: State) -> usize {
    state
        .lineage()
        .find_map(|s| list.iter().position(|t| *t == s))
        .map_or(0, |i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    fn pick(sig: &StateSignifier, states: &[State]) -> State {
        sig.most_significant(states).unwrap()
    }

    #[test]
    fn derivation() {
        assert!(CHANGING.is_derived_from(NORMAL));
        assert!(!NORMAL.is_derived_from(CHANGING));
        assert!(RUNNING.is_derived_from(NORMAL));
        assert!(!CHANGING.is_derived_from(ERROR));
        assert!(HEATED.is_derived_from(NORMAL));
        assert!(!KNOWN.is_derived_from(INCREASING));
        assert!(PAUSED.is_derived_from(DISABLED));
        assert!(ON.is_derived_from(ON));
    }

    #[test]
    fn names_round_trip() {
        assert_eq!("ON".parse::<State>().unwrap(), ON);
        assert_eq!(MOVING_LEFT.to_string(), "MOVING_LEFT");
        assert!("SLEEPY".parse::<State>().is_err());
        for s in State::ALL {
            assert_eq!(State::from_name(s.name()), Some(*s));
        }
    }

    #[test]
    fn default_signifier() {
        let sig = StateSignifier::default();
        let mut s = vec![DISABLED, COOLED, DECREASING];
        assert_eq!(pick(&sig, &s), DECREASING);
        s.push(RAMPING_UP);
        assert_eq!(pick(&StateSignifier::new(ACTIVE, INCREASING), &s), RAMPING_UP);
        assert_eq!(pick(&sig, &s), DECREASING);
        s.push(INTERLOCKED);
        assert_eq!(pick(&sig, &s), INTERLOCKED);
        s.push(UNKNOWN);
        assert_eq!(pick(&sig, &s), UNKNOWN);
        assert_eq!(sig.most_significant(&[]), None);
    }

    #[test]
    fn init_and_interlock_trump() {
        let sig = StateSignifier::default();
        assert_eq!(pick(&sig, &[INIT, RUNNING, CHANGING, NORMAL, PASSIVE, ACTIVE]), INIT);
        assert_eq!(
            pick(&sig, &[RUNNING, CHANGING, NORMAL, PASSIVE, ACTIVE, INTERLOCKED]),
            INTERLOCKED
        );
    }

    #[test]
    fn custom_trump_list() {
        let sig = StateSignifier::with_trump_list(vec![INTERLOCKED, UNKNOWN, KNOWN]);
        let s = [DISABLED, RUNNING, PAUSED, CHANGING, COOLED, DECREASING, UNKNOWN, INTERLOCKED];
        assert_eq!(pick(&sig, &s), CHANGING);
        let s = [DISABLED, CHANGING, ON, DECREASING, RUNNING, PAUSED, UNKNOWN, INTERLOCKED];
        assert_eq!(pick(&sig, &s), CHANGING);
    }

    #[test]
    fn running_trumps_static() {
        let sig = StateSignifier::default();
        let mut s = vec![DISABLED, RUNNING];
        assert_eq!(pick(&sig, &s), RUNNING);
        s.extend([ACTIVE, PASSIVE]);
        assert_eq!(pick(&sig, &s), RUNNING);
        s.push(PAUSED);
        assert_eq!(pick(&sig, &s), PAUSED);
    }

    fn chain(sig: &StateSignifier, second: State) {
        let mut s = vec![ON];
        assert_eq!(pick(sig, &s), ON);
        s.push(STOPPED);
        assert_eq!(pick(sig, &s), second);
        for next in [ACQUIRING, MOVING, INTERLOCKED, ERROR, INIT, UNKNOWN] {
            s.push(next);
            assert_eq!(pick(sig, &s), next);
        }
    }

    #[test]
    fn chains() {
        chain(&StateSignifier::default(), STOPPED);
        chain(&StateSignifier::new(ACTIVE, INCREASING), ON);
    }

    #[test]
    fn changing_preference() {
        let sig = StateSignifier::new(PASSIVE, DECREASING);
        let mut s = vec![DISABLED, ON, STOPPED];
        let steps = [
            (RUNNING, RUNNING),
            (PAUSED, PAUSED),
            (HEATING, HEATING),
            (INCREASING, INCREASING),
            (COOLING, COOLING),
            (DECREASING, DECREASING),
            (MOVING, DECREASING),
            (CHANGING, DECREASING),
            (INTERLOCKED, INTERLOCKED),
        ];
        assert_eq!(pick(&sig, &s), STOPPED);
        for (push, expected) in steps {
            s.push(push);
            assert_eq!(pick(&sig, &s), expected, "after pushing {push}");
        }

        let sig = StateSignifier::new(ACTIVE, INCREASING);
        let mut s = vec![DISABLED, ON, STOPPED, RUNNING, PAUSED];
        let steps = [
            (COOLING, COOLING),
            (DECREASING, DECREASING),
            (HEATING, HEATING),
            (INCREASING, INCREASING),
            (MOVING, INCREASING),
            (CHANGING, INCREASING),
            (ERROR, ERROR),
        ];
        for (push, expected) in steps {
            s.push(push);
            assert_eq!(pick(&sig, &s), expected, "after pushing {push}");
        }
    }
}
