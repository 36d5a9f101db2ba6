//! End-to-end checks of validation and establishment over whole descriptors

use reactive_core::deploy::{Deployer, RandomKeyGenerator, SimulatedAttester, SimulatedToolchain};
use reactive_core::establish::{
    DeploymentIdAllocator, EstablishRequest, Establisher, EstablishmentError, KeyMaterial,
};
use reactive_core::model::{ConnectionView, Descriptor, DescriptorFormat, EntityKind};
use reactive_core::validator::{ValidationResult, Validator, ViolationKind};
use reactive_core::{Record, Value};

fn base() -> Descriptor {
    let text = r#"
nodes:
  - type: sancus
    name: node-a
    host: 10.0.0.1
    reactive_port: 2001
    vendor_id: 4660
    vendor_key: "0b7bf3ae40880a8be430d0da34fb76f0"
  - type: native
    name: node-b
    host: 10.0.0.2
    reactive_port: 5000
modules:
  - type: sancus
    name: m1
    node: node-a
    files: [m1.c]
  - type: native
    name: m2
    node: node-b
connections: []
"#;
    Descriptor::from_str_as(text, DescriptorFormat::Yaml).unwrap()
}

fn with_connection(conn: Record) -> Descriptor {
    let mut d = base();
    d.connections.push(conn);
    d
}

fn scenario_a() -> Record {
    Record::new()
        .with("from_module", "m1")
        .with("from_output", "o1")
        .with("to_module", "m2")
        .with("to_input", "i1")
        .with("encryption", "aes128")
}

fn connection_rules(result: &ValidationResult) -> Vec<String> {
    result
        .failures_for(EntityKind::Connection, 0)
        .map(|f| f.failed_rules().into_iter().map(str::to_string).collect())
        .unwrap_or_default()
}

fn material() -> KeyMaterial {
    KeyMaterial {
        key: "0123456789abcdef0123456789abcdef".into(),
        nonce: 0,
    }
}

#[test]
fn test_scenario_a_unestablished_connection_is_valid() {
    let validator = Validator::builtin().unwrap();
    let d = with_connection(scenario_a());
    let result = validator.validate(&d);
    assert!(result.is_valid(), "{}", result);
}

#[test]
fn test_scenario_b_established_without_key() {
    let validator = Validator::builtin().unwrap();
    let conn = scenario_a()
        .with("established", true)
        .with("name", "c1")
        .with("nonce", 0)
        .with("id", 1)
        .with("direct", false);
    let result = validator.validate(&with_connection(conn));

    assert_eq!(connection_rules(&result), vec!["key mandatory after establishment"]);
    let failure = result.failures_for(EntityKind::Connection, 0).unwrap();
    assert_eq!(failure.violations[0].kind, ViolationKind::Schema);
}

#[test]
fn test_scenario_b_reports_every_missing_field() {
    let validator = Validator::builtin().unwrap();
    let conn = scenario_a().with("established", true);
    let rules = connection_rules(&validator.validate(&with_connection(conn)));
    for field in ["key", "nonce", "id", "name", "direct"] {
        let rule = format!("{} mandatory after establishment", field);
        assert!(rules.contains(&rule), "missing {rule}");
    }
}

#[test]
fn test_scenario_c_direct_handler_needs_request() {
    let validator = Validator::builtin().unwrap();
    let conn = Record::new()
        .with("direct", true)
        .with("to_module", "m2")
        .with("to_handler", "h1")
        .with("encryption", "plain");
    let rules = connection_rules(&validator.validate(&with_connection(conn)));
    assert!(rules.contains(&"to_handler requires from_request".to_string()));
}

fn sorted_connection_rules(conn: Record) -> Vec<String> {
    let validator = Validator::builtin().unwrap();
    let mut rules = connection_rules(&validator.validate(&with_connection(conn)));
    rules.sort();
    rules
}

const SOURCE_XOR: &str = "either direct or from_module with exactly one of from_output/from_request";

#[test]
fn test_direct_connection_with_source_module() {
    let conn = scenario_a().with("direct", true);
    assert_eq!(
        sorted_connection_rules(conn),
        vec!["direct connections have no from_module", SOURCE_XOR]
    );
}

#[test]
fn test_connection_without_source_or_direct() {
    let conn = Record::new()
        .with("to_module", "m2")
        .with("to_input", "i1")
        .with("encryption", "aes");
    assert_eq!(
        sorted_connection_rules(conn),
        vec!["direct or from_output->to_input or from_request->to_handler", SOURCE_XOR]
    );
}

#[test]
fn test_connection_with_output_and_request() {
    let conn = scenario_a().with("from_request", "r1");
    assert_eq!(
        sorted_connection_rules(conn),
        vec![SOURCE_XOR, "from_request requires to_handler"]
    );
}

#[test]
fn test_connection_to_itself() {
    let conn = scenario_a().with("from_module", "m2");
    assert_eq!(
        sorted_connection_rules(conn),
        vec!["from_module and to_module must be different"]
    );
}

#[test]
fn test_scenario_d_concurrent_establishment_ids_are_unique() {
    let validator = Validator::builtin().unwrap();
    let mut d = base();
    for i in 0..16 {
        d.connections.push(scenario_a().with("name", format!("c{}", i)));
    }

    let allocator = DeploymentIdAllocator::from_descriptor(&d);
    let establisher = Establisher::from_registry(validator.registry(), &allocator);
    std::thread::scope(|s| {
        for conn in d.connections.iter_mut() {
            let establisher = &establisher;
            s.spawn(move || establisher.establish(conn, EstablishRequest::new(material())).unwrap());
        }
    });

    let mut ids: Vec<u16> = d
        .connections
        .iter()
        .map(|r| ConnectionView::new(r).id().unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert!(validator.validate(&d).is_valid());
}

#[tokio::test]
async fn test_scenario_d_through_deployer() {
    let deployer = Deployer::new(
        Validator::builtin().unwrap(),
        SimulatedToolchain::default(),
        SimulatedAttester::default(),
        RandomKeyGenerator,
    );
    let mut d = base();
    for i in 0..8 {
        d.connections.push(scenario_a().with("name", format!("c{}", i)));
    }

    let report = deployer.deploy(&mut d).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures);
    let mut ids: Vec<u16> = report.established.iter().map(|c| c.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[test]
fn test_validation_is_idempotent() {
    let validator = Validator::builtin().unwrap();
    let d = with_connection(scenario_a());
    let before = d.fingerprint();
    let first = validator.validate(&d);
    let second = validator.validate(&d);
    assert_eq!(first, ValidationResult::Valid);
    assert_eq!(first, second);
    assert_eq!(d.fingerprint(), before);
}

#[test]
fn test_establish_is_exactly_once() {
    let validator = Validator::builtin().unwrap();
    let mut d = with_connection(scenario_a());
    let allocator = DeploymentIdAllocator::from_descriptor(&d);
    let establisher = Establisher::from_registry(validator.registry(), &allocator);

    let id = establisher
        .establish(&mut d.connections[0], EstablishRequest::new(material()))
        .unwrap();
    let before = d.connections[0].clone();

    let again = KeyMaterial {
        key: "ffffffffffffffffffffffffffffffff".into(),
        nonce: 9,
    };
    let err = establisher
        .establish(&mut d.connections[0], EstablishRequest::new(again))
        .unwrap_err();
    assert!(matches!(err, EstablishmentError::AlreadyEstablished(_)));
    assert_eq!(d.connections[0], before);
    assert_eq!(ConnectionView::new(&d.connections[0]).id(), Some(id));
}

#[test]
fn test_allocator_respects_existing_ids() {
    let validator = Validator::builtin().unwrap();
    let mut d = base();
    d.connections.push(
        scenario_a()
            .with("established", true)
            .with("name", "old")
            .with("key", "00")
            .with("nonce", 3)
            .with("id", 1)
            .with("direct", false),
    );
    d.connections.push(scenario_a().with("name", "new"));
    assert!(validator.validate(&d).is_valid());

    let allocator = DeploymentIdAllocator::from_descriptor(&d);
    let establisher = Establisher::from_registry(validator.registry(), &allocator);
    let id = establisher
        .establish(&mut d.connections[1], EstablishRequest::new(material()))
        .unwrap();
    assert_eq!(id, 2);
}

#[test]
fn test_unknown_keys_are_rejected_for_every_kind() {
    let validator = Validator::builtin().unwrap();
    let mut d = with_connection(scenario_a());
    d.nodes[0].set("colour", "blue");
    d.modules[1].set("files", "m2.c"); // sancus-only field on a native module
    d.connections[0].set("priority", 1);

    let result = validator.validate(&d);
    for (kind, index) in [
        (EntityKind::Node, 0),
        (EntityKind::Module, 1),
        (EntityKind::Connection, 0),
    ] {
        let failure = result.failures_for(kind, index).unwrap();
        assert!(
            failure.failed_rules().contains(&"only authorized keys"),
            "{}",
            failure.entity
        );
    }
}

#[test]
fn test_unknown_type_uses_default_rules_only() {
    let validator = Validator::builtin().unwrap();
    let mut d = base();
    d.modules.push(
        Record::new()
            .with("type", "keystone")
            .with("name", "m3")
            .with("node", "node-b"),
    );
    assert!(validator.validate(&d).is_valid());

    d.modules[2].set("files", Value::List(Vec::new()));
    let failure = validator.validate(&d);
    assert!(failure
        .failures_for(EntityKind::Module, 2)
        .unwrap()
        .failed_rules()
        .contains(&"only authorized keys"));
}

#[test]
fn test_yaml_round_trip_of_deployed_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let validator = Validator::builtin().unwrap();
    let mut d = with_connection(scenario_a());
    let allocator = DeploymentIdAllocator::new();
    Establisher::from_registry(validator.registry(), &allocator)
        .establish(&mut d.connections[0], EstablishRequest::new(material()))
        .unwrap();

    let path = dir.path().join("deployed.yaml");
    d.save(&path, DescriptorFormat::Yaml).unwrap();
    let (reloaded, _) = Descriptor::load(&path).unwrap();
    assert_eq!(reloaded, d);
    assert!(validator.validate(&reloaded).is_valid());
}
