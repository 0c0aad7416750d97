use std::process::ExitCode;

use oastest_core::RunReport;

pub(crate) fn error_exit(message: &str) -> ExitCode {
    eprintln!("{message}");
    ExitCode::from(1)
}

pub(crate) fn print_summary(report: &RunReport) {
    for test in &report.results {
        if let Some(error) = &test.runtime.schema_error {
            println!("schema mismatch in {} ({}):\n{error}", test.name, test.path);
        }
    }
    for test in &report.results {
        if let Some(error) = &test.runtime.response_error {
            println!("error in {} ({}):\n{error}", test.name, test.path);
        }
    }
    let counts = &report.counts;
    println!("passed: {}", counts.passed);
    println!("failed: {}", counts.failed);
    println!("fuzz failures: {}", report.new_failures.len());
    println!("skipped: {}", counts.skipped);
    println!("schema mismatches: {}", counts.schema_mismatch);
    println!("total: {}", counts.total);
}

pub(crate) fn exit_code_for_report(report: &RunReport) -> ExitCode {
    if report.counts.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
