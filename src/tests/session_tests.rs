// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::session::SessionState;

#[test]
fn test_forward_transitions_allowed() {
    use SessionState::*;
    assert!(Active.can_transition_to(Claiming));
    assert!(Claiming.can_transition_to(Claimed));
    assert!(Claimed.can_transition_to(Proving));
    assert!(Proving.can_transition_to(Settled));
    assert!(Claimed.can_transition_to(Settled));
    for state in SessionState::NON_TERMINAL {
        assert!(state.can_transition_to(Expired), "{state} -> expired");
    }
}

#[test]
fn test_regressions_rejected() {
    use SessionState::*;
    assert!(!Claimed.can_transition_to(Active));
    assert!(!Proving.can_transition_to(Claiming));
    assert!(!Settled.can_transition_to(Expired));
    assert!(!Expired.can_transition_to(Settled));
    assert!(!Expired.can_transition_to(Active));
}

#[test]
fn test_same_state_is_noop_transition() {
    for state in SessionState::ALL {
        assert!(state.can_transition_to(state));
    }
}

#[test]
fn test_parse_round_trips_names() {
    for state in SessionState::ALL {
        assert_eq!(SessionState::parse(state.as_str()), Some(state));
    }
    assert_eq!(SessionState::parse("bogus"), None);
}
