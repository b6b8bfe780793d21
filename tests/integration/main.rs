//! Integration test entry point
//!
//! Exercises the crate end to end: the RPC client against stub
//! editor-client binaries, and the supervisor lifecycle against a
//! scripted pinger.

#[cfg(unix)]
mod rpc;
mod supervisor;

/// Write an executable stub client script and return its path.
#[cfg(unix)]
pub fn stub_client(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}
