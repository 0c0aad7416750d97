//! CLI wrapper around `oastest-core`: plan generation and plan running.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use oastest_core::{
    build_dag, generate_object_plan, generate_path_plan, generate_simple_plan, read_failure_index,
    read_path_list, read_unique_keys, write_failures, Auth, Context, Dataset, FuzzMode, Spec,
    TestPlan,
};

mod cli;
mod output;

pub use cli::{Algorithm, Cli, Command, FuzzArg};

use output::{error_exit, exit_code_for_report, print_summary};

pub async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Generate {
            out_dir,
            spec,
            algorithm,
            verbose: _,
            whitelist,
            ignored_paths,
        } => generate(&out_dir, &spec, algorithm, whitelist, ignored_paths),
        Command::Run {
            plan,
            spec,
            result_file,
            base_url,
            username,
            password,
            api_token,
            dataset,
            fuzz_type,
            repro,
            data_dir,
            batch_size,
            verbose: _,
        } => {
            run_plan(RunArgs {
                plan,
                spec,
                result_file,
                base_url,
                auth: Auth {
                    username,
                    password,
                    api_token,
                },
                dataset,
                fuzz_mode: fuzz_type.into(),
                repro,
                data_dir,
                batch_size,
            })
            .await
        }
    }
}

fn generate(
    out_dir: &Path,
    spec_path: &Path,
    algorithm: Algorithm,
    whitelist: Option<PathBuf>,
    ignored_paths: Option<PathBuf>,
) -> ExitCode {
    let spec = match Spec::from_file(spec_path) {
        Ok(spec) => spec,
        Err(error) => return error_exit(&format!("can't load spec {}: {error}", spec_path.display())),
    };
    let dag = match build_dag(&spec) {
        Ok(dag) => dag,
        Err(error) => return error_exit(&format!("can't build dependency graph: {error}")),
    };
    let whitelist = match whitelist.map(|path| read_path_list(&path)).transpose() {
        Ok(list) => list,
        Err(error) => return error_exit(&format!("can't read whitelist: {error}")),
    };
    let ignored = match ignored_paths.map(|path| read_path_list(&path)).transpose() {
        Ok(list) => list,
        Err(error) => return error_exit(&format!("can't read ignored paths: {error}")),
    };
    if !out_dir.exists() {
        if let Err(error) = std::fs::create_dir_all(out_dir) {
            return error_exit(&format!(
                "can't create the directory {}: {error}",
                out_dir.display()
            ));
        }
    }

    let selected: Vec<Algorithm> = match algorithm {
        Algorithm::All => vec![Algorithm::Simple, Algorithm::Object, Algorithm::Path],
        one => vec![one],
    };
    for algo in selected {
        let (name, plan) = match algo {
            Algorithm::Simple => ("simple", generate_simple_plan(&spec, &dag)),
            Algorithm::Object => ("object", generate_object_plan(&spec, &dag)),
            Algorithm::Path | Algorithm::All => (
                "path",
                generate_path_plan(&spec, &dag, whitelist.as_ref(), ignored.as_ref()),
            ),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(error) => return error_exit(&format!("can't generate {name} plan: {error}")),
        };
        let plan_file = out_dir.join(format!("{name}.yml"));
        if let Err(error) = plan.dump_to_file(&plan_file) {
            return error_exit(&format!("can't write {}: {error}", plan_file.display()));
        }
        println!("test plan generated at {}", plan_file.display());
    }
    ExitCode::SUCCESS
}

struct RunArgs {
    plan: PathBuf,
    spec: PathBuf,
    result_file: Option<PathBuf>,
    base_url: Option<String>,
    auth: Auth,
    dataset: Option<PathBuf>,
    fuzz_mode: FuzzMode,
    repro: bool,
    data_dir: PathBuf,
    batch_size: usize,
}

async fn run_plan(args: RunArgs) -> ExitCode {
    let spec = match Spec::from_file(&args.spec) {
        Ok(spec) => Arc::new(spec),
        Err(error) => {
            return error_exit(&format!("can't load spec {}: {error}", args.spec.display()))
        }
    };
    let base_url = match args
        .base_url
        .or_else(|| spec.base_url().map(str::to_string))
    {
        Some(url) => url,
        None => return error_exit("no base URL: the spec declares no servers and none was given"),
    };

    let (dataset, done_data) = if args.fuzz_mode == FuzzMode::None {
        (Dataset::default(), Dataset::default())
    } else {
        match Dataset::load(
            args.dataset.as_deref(),
            &args.data_dir,
            args.fuzz_mode,
            args.batch_size,
        ) {
            Ok(loaded) => loaded,
            Err(error) => return error_exit(&format!("can't load dataset: {error}")),
        }
    };
    let unique_keys = match read_unique_keys(&args.data_dir) {
        Ok(keys) => keys,
        Err(error) => return error_exit(&format!("can't read unique keys: {error}")),
    };
    let old_failures = match read_failure_index(&args.data_dir) {
        Ok(index) => index,
        Err(error) => return error_exit(&format!("can't read failure log: {error}")),
    };

    let ctx = match Context::new(spec, base_url) {
        Ok(ctx) => ctx,
        Err(error) => return error_exit(&format!("can't build HTTP client: {error}")),
    };
    let ctx = Arc::new(
        ctx.with_auth(args.auth)
            .with_dataset(dataset)
            .with_unique_keys(unique_keys)
            .with_fuzz_mode(args.fuzz_mode)
            .with_repro(args.repro)
            .with_old_failures(old_failures),
    );

    let plan = match TestPlan::from_file(&args.plan) {
        Ok(plan) => plan,
        Err(error) => {
            return error_exit(&format!("can't load plan {}: {error}", args.plan.display()))
        }
    };

    let report = plan.run_all(&ctx).await;

    let result_file = args
        .result_file
        .unwrap_or_else(|| args.data_dir.join("result.yml"));
    if let Err(error) = TestPlan::write_result_file(&result_file, &report.results) {
        return error_exit(&format!(
            "can't write result file {}: {error}",
            result_file.display()
        ));
    }
    if !report.new_failures.is_empty() || args.repro {
        if let Err(error) = write_failures(&args.data_dir, &report.new_failures, args.repro) {
            return error_exit(&format!("can't write failure log: {error}"));
        }
    }
    if args.fuzz_mode != FuzzMode::None && !args.repro {
        if let Err(error) = Dataset::write_done(&args.data_dir, &done_data) {
            return error_exit(&format!("can't write done data: {error}"));
        }
    }

    print_summary(&report);
    exit_code_for_report(&report)
}
