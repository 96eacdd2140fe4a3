mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::PASSWORD;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_malformed_csv_handling() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("robustness_test.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(["username", "email", "password", "role"])
        .unwrap();

    // Valid buyer
    wtr.write_record(["alice", "alice@example.com", PASSWORD, "buyer"])
        .unwrap();
    // Unknown role
    wtr.write_record(["mallory", "mallory@example.com", PASSWORD, "superuser"])
        .unwrap();
    // Valid seller
    wtr.write_record(["bob", "bob@example.com", PASSWORD, "seller"])
        .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("carbon-market"));
    cmd.arg("seed").arg(&output_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading user record"))
        .stdout(predicate::str::contains(",alice,Buyer"))
        .stdout(predicate::str::contains(",bob,Seller"))
        .stdout(predicate::str::contains("mallory").not())
        .stdout(predicate::str::contains("seeded 2 users"));
}

#[test]
fn test_invalid_accounts_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("invalid_accounts.csv");
    let mut wtr = csv::Writer::from_path(&output_path).unwrap();
    wtr.write_record(["username", "email", "password", "role", "organization_name", "organization_type", "wallet_address"])
        .unwrap();

    // Password too short
    wtr.write_record(["carol", "carol@example.com", "short", "buyer", "", "", ""])
        .unwrap();
    // Malformed wallet address
    wtr.write_record(["dave", "dave@example.com", PASSWORD, "seller", "", "", "0x123"])
        .unwrap();
    // Duplicate username
    wtr.write_record(["erin", "erin@example.com", PASSWORD, "buyer", "", "", ""])
        .unwrap();
    wtr.write_record(["erin", "erin2@example.com", PASSWORD, "buyer", "", "", ""])
        .unwrap();
    wtr.flush().unwrap();
    drop(wtr);

    let mut cmd = Command::new(cargo_bin!("carbon-market"));
    cmd.arg("seed").arg(&output_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error creating user"))
        .stdout(predicate::str::contains(",erin,Buyer"))
        .stdout(predicate::str::contains("seeded 1 users"));
}

#[test]
fn test_missing_input_file_fails() {
    let mut cmd = Command::new(cargo_bin!("carbon-market"));
    cmd.arg("seed").arg("does/not/exist.csv");

    cmd.assert().failure();
}
