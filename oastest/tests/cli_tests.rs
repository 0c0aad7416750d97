use clap::Parser;
use oastest::{Algorithm, Cli, Command, FuzzArg};

#[test]
fn generate_defaults() {
    let cli = Cli::try_parse_from(["oastest", "generate"]).expect("parse");
    match cli.command {
        Command::Generate {
            out_dir,
            spec,
            algorithm,
            verbose,
            whitelist,
            ignored_paths,
        } => {
            assert_eq!(out_dir.to_str(), Some("meqa_data"));
            assert_eq!(spec.to_str(), Some("meqa_data/swagger.yml"));
            assert_eq!(algorithm, Algorithm::All);
            assert!(!verbose);
            assert!(whitelist.is_none());
            assert!(ignored_paths.is_none());
        }
        _ => panic!("expected generate"),
    }
}

#[test]
fn generate_accepts_short_flags() {
    let cli = Cli::try_parse_from([
        "oastest", "generate", "-d", "out", "-s", "api.yml", "-a", "path", "-v", "-w",
        "allow.txt", "-i", "deny.txt",
    ])
    .expect("parse");
    assert!(cli.verbose());
    match cli.command {
        Command::Generate {
            out_dir,
            spec,
            algorithm,
            whitelist,
            ignored_paths,
            ..
        } => {
            assert_eq!(out_dir.to_str(), Some("out"));
            assert_eq!(spec.to_str(), Some("api.yml"));
            assert_eq!(algorithm, Algorithm::Path);
            assert_eq!(whitelist.as_deref().and_then(|p| p.to_str()), Some("allow.txt"));
            assert_eq!(
                ignored_paths.as_deref().and_then(|p| p.to_str()),
                Some("deny.txt")
            );
        }
        _ => panic!("expected generate"),
    }
}

#[test]
fn run_requires_plan_and_spec() {
    assert!(Cli::try_parse_from(["oastest", "run"]).is_err());
    assert!(Cli::try_parse_from(["oastest", "run", "--plan", "simple.yml"]).is_err());

    let cli = Cli::try_parse_from([
        "oastest", "run", "--plan", "simple.yml", "-s", "api.yml",
    ])
    .expect("parse");
    match cli.command {
        Command::Run {
            plan,
            spec,
            fuzz_type,
            repro,
            batch_size,
            ..
        } => {
            assert_eq!(plan.to_str(), Some("simple.yml"));
            assert_eq!(spec.to_str(), Some("api.yml"));
            assert_eq!(fuzz_type, FuzzArg::None);
            assert!(!repro);
            assert_eq!(batch_size, 10);
        }
        _ => panic!("expected run"),
    }
}

#[test]
fn run_accepts_fuzz_and_auth_options() {
    let cli = Cli::try_parse_from([
        "oastest",
        "run",
        "--plan",
        "object.yml",
        "-s",
        "api.yml",
        "--base-url",
        "http://localhost:8080",
        "--api-token",
        "secret",
        "--fuzz-type",
        "negative",
        "--repro",
        "--batch-size",
        "3",
    ])
    .expect("parse");
    match cli.command {
        Command::Run {
            base_url,
            api_token,
            fuzz_type,
            repro,
            batch_size,
            ..
        } => {
            assert_eq!(base_url.as_deref(), Some("http://localhost:8080"));
            assert_eq!(api_token, "secret");
            assert_eq!(fuzz_type, FuzzArg::Negative);
            assert!(repro);
            assert_eq!(batch_size, 3);
        }
        _ => panic!("expected run"),
    }
}
