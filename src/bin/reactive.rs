//! Reactive CLI: validate, build and deploy TEE module descriptors
//!
//! Commands:
//!   reactive validate  check a descriptor against the rule sets
//!   reactive build     validate, then build every module (dry run)
//!   reactive deploy    deploy modules, attest them, establish connections
//!   reactive rules     list rule sets and their rules

use reactive_core::config::ToolConfig;
use reactive_core::deploy::{DeployError, Deployer, RandomKeyGenerator, SimulatedAttester, SimulatedToolchain};
use reactive_core::model::{Descriptor, DescriptorFormat, EntityKind};
use reactive_core::rules::RuleRegistry;
use reactive_core::validator::{ValidationResult, Validator};
use std::env;
use std::process;
use std::sync::Arc;

fn print_usage() {
    println!(
        r#"
Reactive: validation and connection lifecycle for TEE module deployments

Usage: reactive [--verbose|--debug] <command> [options]

Commands:
  validate <descriptor>                                   Check a descriptor
  build    <descriptor>                                   Validate and build all modules
  deploy   <descriptor> [--result <file>] [--output json|yaml]
                                                          Deploy, attest and connect
  rules    [kind] [type]                                  Show rule sets

Environment:
  REACTIVE_CONFIG       config file (default reactive.yaml)
  REACTIVE_RULES_DIR    directory overriding the built-in rules
  REACTIVE_BUILD_MODE   debug | release
  REACTIVE_OUTPUT       json | yaml

Examples:
  reactive validate descriptor.json
  reactive deploy descriptor.yaml --result deployed.yaml --output yaml
  reactive rules module sancus
"#
    );
}

/// Default log filter: `info`, raised to `debug` by `--verbose` or `--debug`
fn log_level(args: &[String]) -> &'static str {
    if args.iter().any(|a| a == "--debug" || a == "--verbose") {
        "debug"
    } else {
        "info"
    }
}

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let level = log_level(&args);
    args.retain(|a| a != "--debug" && a != "--verbose");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    if args.is_empty() {
        print_usage();
        return;
    }

    let code = match args[0].as_str() {
        "validate" => cmd_validate(&args[1..]),
        "build" => cmd_build(&args[1..]).await,
        "deploy" => cmd_deploy(&args[1..]).await,
        "rules" => cmd_rules(&args[1..]),
        "call" | "output" | "request" => {
            eprintln!("  '{}' needs a node transport, which this build does not include", args[0]);
            2
        }
        "help" | "--help" | "-h" => {
            print_usage();
            0
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            2
        }
    };
    process::exit(code);
}

fn load_config() -> Option<ToolConfig> {
    match ToolConfig::load() {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("  {}", e);
            None
        }
    }
}

fn load_validator(config: &ToolConfig) -> Option<Validator> {
    match config.registry() {
        Ok(registry) => Some(Validator::new(Arc::new(registry))),
        Err(e) => {
            eprintln!("  Failed to load rules: {}", e);
            None
        }
    }
}

fn load_descriptor(path: &str) -> Option<(Descriptor, DescriptorFormat)> {
    match Descriptor::load(path) {
        Ok(loaded) => {
            log::info!("Loaded {} ({})", path, loaded.1);
            Some(loaded)
        }
        Err(e) => {
            eprintln!("  Failed to load {}: {}", path, e);
            None
        }
    }
}

/// Value following `flag`, if any
fn option_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn print_violations(result: &ValidationResult) {
    for entity in result.failures() {
        eprintln!("  {}", entity.entity);
        for v in &entity.violations {
            eprintln!("    - {}", v);
        }
    }
}

fn cmd_validate(args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        eprintln!("Usage: reactive validate <descriptor>");
        return 2;
    };
    let Some(config) = load_config() else { return 1 };
    let Some(validator) = load_validator(&config) else { return 1 };
    let Some((descriptor, _)) = load_descriptor(path) else { return 1 };

    println!("  {}", descriptor.summary());
    let result = validator.validate(&descriptor);
    if result.is_valid() {
        println!("  Valid");
        0
    } else {
        eprintln!("  Invalid: {} violation(s)", result.violation_count());
        print_violations(&result);
        1
    }
}

fn deployer(config: &ToolConfig, validator: Validator) -> Deployer<SimulatedToolchain, SimulatedAttester, RandomKeyGenerator> {
    Deployer::new(
        validator,
        SimulatedToolchain::new(config.build_mode, config.build_dir.clone()),
        SimulatedAttester::default(),
        RandomKeyGenerator,
    )
}

async fn cmd_build(args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        eprintln!("Usage: reactive build <descriptor>");
        return 2;
    };
    let Some(config) = load_config() else { return 1 };
    let Some(validator) = load_validator(&config) else { return 1 };
    let Some((descriptor, _)) = load_descriptor(path) else { return 1 };

    match deployer(&config, validator).build(&descriptor).await {
        Ok(report) => {
            for artifact in &report.built {
                println!("  {} -> {}", artifact.module, artifact.binary.display());
            }
            for failure in &report.failures {
                eprintln!("  {}: {}", failure.entity, failure.error);
            }
            println!("  {}", report.summary());
            if report.is_success() { 0 } else { 1 }
        }
        Err(e) => {
            eprintln!("  {}", e);
            let DeployError::Invalid(failures) = e;
            print_violations(&ValidationResult::Invalid(failures));
            1
        }
    }
}

async fn cmd_deploy(args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        eprintln!("Usage: reactive deploy <descriptor> [--result <file>] [--output json|yaml]");
        return 2;
    };
    let Some(config) = load_config() else { return 1 };
    let Some(validator) = load_validator(&config) else { return 1 };
    let Some((mut descriptor, _)) = load_descriptor(path) else { return 1 };

    let format = match option_value(args, "--output") {
        Some(f) => match f.parse::<DescriptorFormat>() {
            Ok(format) => format,
            Err(e) => {
                eprintln!("  {}", e);
                return 2;
            }
        },
        None => config.output_format,
    };

    let report = match deployer(&config, validator).deploy(&mut descriptor).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("  {}", e);
            let DeployError::Invalid(failures) = e;
            print_violations(&ValidationResult::Invalid(failures));
            return 1;
        }
    };

    for conn in &report.established {
        println!("  Established {} (id {})", conn.name, conn.id);
    }
    for failure in &report.failures {
        eprintln!("  {} [{:?}]: {}", failure.entity, failure.stage, failure.error);
    }
    for entity in &report.output_violations {
        eprintln!("  Output violates rules: {} {:?}", entity.entity, entity.failed_rules());
    }

    match option_value(args, "--result") {
        Some(result) => match descriptor.save(result, format) {
            Ok(()) => println!("  Saved deployed descriptor to {}", result),
            Err(e) => {
                eprintln!("  Failed to save {}: {}", result, e);
                return 1;
            }
        },
        None => match descriptor.to_string_as(format) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("  {}", e);
                return 1;
            }
        },
    }

    println!("  {}", report.summary());
    if report.is_success() { 0 } else { 1 }
}

fn cmd_rules(args: &[String]) -> i32 {
    let Some(config) = load_config() else { return 1 };
    let registry: RuleRegistry = match config.registry() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("  Failed to load rules: {}", e);
            return 1;
        }
    };

    let kinds: Vec<EntityKind> = match args.first() {
        Some(name) => match EntityKind::from_name(name) {
            Some(kind) => vec![kind],
            None => {
                eprintln!("  Unknown kind '{}', expected node, module or connection", name);
                return 2;
            }
        },
        None => EntityKind::ALL.to_vec(),
    };
    let ty = args.get(1).map(String::as_str);

    for kind in kinds {
        let resolved = registry.resolve(kind, ty);
        println!(
            "\n  {} rules{} ({} rules, types: {})",
            kind,
            resolved
                .entity_type
                .as_deref()
                .map(|t| format!(" for type '{}'", t))
                .unwrap_or_default(),
            resolved.rule_count(),
            registry.known_types(kind).join(", ")
        );
        println!("  {}", "-".repeat(72));
        for set in &resolved.sets {
            for rule in &set.rules {
                println!("  [{}] {}: {}", set.label, rule.name, rule.expr);
            }
        }
        let keys: Vec<&str> = resolved.authorized.iter().map(String::as_str).collect();
        println!("  authorized keys: {}", keys.join(", "));
    }
    0
}
