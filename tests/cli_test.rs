use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("seed").arg("tests/fixtures/users.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("id,username,role"))
        .stdout(predicate::str::contains(",admin,Admin"))
        .stdout(predicate::str::contains(",seller1,Seller"))
        .stdout(predicate::str::contains(",buyer1,Buyer"))
        .stdout(predicate::str::contains("seeded 3 users"));

    Ok(())
}

#[test]
fn test_cli_requires_subcommand() {
    let mut cmd = Command::new(cargo_bin!("carbon-market"));
    cmd.assert().failure();
}
