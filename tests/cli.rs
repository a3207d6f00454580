use std::process::Command;

use assert_cmd::prelude::*;
use mastercache::MasterConnector;
use predicates::str::{contains, is_empty};

mod common;
use common::{config, open_server, Business};

// `mastercache-client` with no args should exit with a non-zero code.
#[test]
fn client_cli_no_args() {
    Command::cargo_bin("mastercache-client")
        .unwrap()
        .assert()
        .failure();
}

#[test]
fn client_cli_version() {
    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn server_cli_version() {
    Command::cargo_bin("mastercache-server")
        .unwrap()
        .args(&["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn client_cli_invalid_addr() {
    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["ping", "--addr", "invalid-addr"])
        .assert()
        .failure();
}

#[test]
fn client_cli_invalid_table() {
    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["count", "businesses"])
        .assert()
        .failure();

    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["count"])
        .assert()
        .failure();
}

#[test]
fn client_cli_invalid_subcommand() {
    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["truncate", "10"])
        .assert()
        .failure();
}

#[test]
fn server_cli_invalid_pool() {
    Command::cargo_bin("mastercache-server")
        .unwrap()
        .args(&["--pool", "fibers"])
        .assert()
        .failure();
}

#[test]
fn server_cli_invalid_threads() {
    Command::cargo_bin("mastercache-server")
        .unwrap()
        .args(&["--threads", "0", "--addr", "127.0.0.1:0"])
        .assert()
        .failure();
}

#[test]
fn client_cli_talks_to_a_master() {
    let addr = open_server();
    let conn = MasterConnector::connect(config(addr)).unwrap();
    conn.put_row(&Business::new(1, "acme")).unwrap();
    conn.put_row(&Business::new(2, "globex")).unwrap();
    let addr = addr.to_string();

    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["ping", "--addr", &addr])
        .assert()
        .success()
        .stdout(contains("pong"));

    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["count", "10", "--addr", &addr])
        .assert()
        .success()
        .stdout("2\n");

    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["count", "11", "--addr", &addr])
        .assert()
        .success()
        .stdout("0\n");

    Command::cargo_bin("mastercache-client")
        .unwrap()
        .args(&["invalidate", "10", "--addr", &addr])
        .assert()
        .success()
        .stdout("10\n")
        .stderr(is_empty());
}
