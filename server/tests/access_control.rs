//! End-to-end check of the access-control decision used by the job routes:
//! parsing the `--admins` flag's value and deciding who may reach a job.
use envdeploy_core::users::{AdminSet, User};

#[test]
fn admins_parsed_from_cli_flag_can_reach_anyones_job() {
    let admins = AdminSet::parse("root, ops,,alice");
    let alice = User::new("alice");
    let bob = User::new("bob");

    assert!(admins.can_access_job(&alice, &bob));
    assert!(!admins.can_access_job(&bob, &alice));
    assert!(admins.can_access_job(&bob, &bob));
}
