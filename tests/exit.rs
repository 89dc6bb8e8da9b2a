//! The terminating error paths. Each test re-runs itself in a child copy of
//! this binary with `BRINY_CL_EXIT_CASE` set; the child takes the exiting
//! path and the parent checks its status and stderr.

use briny_cl::driver::reference::ReferenceDriver;
use briny_cl::*;
use std::process::{Command, Output};
use std::sync::Arc;

const CASE_VAR: &str = "BRINY_CL_EXIT_CASE";

fn in_child() -> bool {
    std::env::var_os(CASE_VAR).is_some()
}

fn run_child(test: &str) -> Output {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, "1")
        .output()
        .unwrap()
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn test_fatal_policy_exits_on_context_error() {
    if in_child() {
        let session = Session::open(samples::reference_driver(), &HarnessConfig::default()).unwrap();
        let program = session.build(samples::VECTOR_ADD_CL).unwrap();
        let a = [1.0f32; 4];
        let buf_a = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
        let buf_b = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
        let out = session.buffer(MemAccess::ReadOnly, 4 * 4).unwrap();
        let mut kernel = program.create_kernel("vector_add").unwrap();
        kernel
            .set_args(&[KernelArg::Buffer(&buf_a), KernelArg::Buffer(&buf_b), KernelArg::Buffer(&out)])
            .unwrap();
        let _ = kernel.enqueue(session.queue(), &NdRange::linear(4));
        panic!("the context error hook returned");
    }
    let out = run_child("test_fatal_policy_exits_on_context_error");
    let stderr = stderr_of(&out);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("context error: "), "{stderr}");
    assert!(stderr.contains("READ_ONLY argument 2"), "{stderr}");
}

#[test]
fn test_open_or_exit_without_platforms() {
    if in_child() {
        let driver = Arc::new(ReferenceDriver::builder().build());
        let _session = Session::open_or_exit(driver, &HarnessConfig::default());
        panic!("open_or_exit returned");
    }
    let out = run_child("test_open_or_exit_without_platforms");
    let stderr = stderr_of(&out);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("failed to open a compute session: no compute platform found"), "{stderr}");
}

#[test]
fn test_or_exit_prints_the_build_log() {
    if in_child() {
        let config = HarnessConfig::builder().error_policy(ErrorPolicy::LogOnly).build().unwrap();
        let session = Session::open(samples::reference_driver(), &config).unwrap();
        let _program = session
            .build("__kernel void broken(__global flaot *x) {}\n")
            .or_exit("failed to build broken");
        panic!("or_exit returned");
    }
    let out = run_child("test_or_exit_prints_the_build_log");
    let stderr = stderr_of(&out);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("failed to build broken: program build failed"), "{stderr}");
    assert!(stderr.contains("error: unknown type name 'flaot'"), "{stderr}");
}

#[test]
fn test_success_does_not_exit() {
    let value: Result<u32> = Ok(7);
    assert_eq!(value.or_exit("unreachable"), 7);
}
