use std::sync::Arc;

use strata_substrate::InMemorySubstrate;
use strata_types::{ManualClock, Timestamp, Urn, ValueKind};

use crate::config::StoreConfig;
use crate::factory::Factory;
use crate::schema::{Attribute, Retention, Schema, SchemaRegistry};

pub(crate) const TEST_OBJECT: &str = "TestObject";
pub(crate) const TEST_NEWEST: &str = "TestNewest";
pub(crate) const TEST_CLIENT: &str = "TestClient";
pub(crate) const TEST_FILE: &str = "TestFile";

pub(crate) const STORED: &str = "test:stored";
pub(crate) const CLOCK: &str = "test:clock";
pub(crate) const PROTECTED: &str = "test:protected";
pub(crate) const HOSTNAME: &str = "test:hostname";
pub(crate) const PATH: &str = "test:path";

pub(crate) struct Harness {
    pub substrate: Arc<InMemorySubstrate>,
    pub clock: Arc<ManualClock>,
    pub factory: Factory,
}

impl Harness {
    pub fn clock_now(&self) -> Timestamp {
        self.factory.now()
    }
}

pub(crate) fn harness() -> Harness {
    harness_with(StoreConfig::default())
}

pub(crate) fn harness_with(config: StoreConfig) -> Harness {
    init_tracing();
    let substrate = Arc::new(InMemorySubstrate::new());
    let clock = Arc::new(ManualClock::at_secs(1000));
    let factory = Factory::new(substrate.clone(), test_registry(), clock.clone(), config)
        .expect("valid test config");
    Harness {
        substrate,
        clock,
        factory,
    }
}

pub(crate) fn urn(path: &str) -> Urn {
    Urn::parse(path).expect("valid test urn")
}

pub(crate) fn test_registry() -> SchemaRegistry {
    let stored = || Attribute::new(STORED, ValueKind::String, "A stored string");
    let mut registry = SchemaRegistry::with_builtins();
    registry.register(
        Schema::new(TEST_OBJECT)
            .with_attribute(stored())
            .with_attribute(
                Attribute::new(CLOCK, ValueKind::Integer, "An unversioned counter").unversioned(),
            )
            .with_attribute(
                Attribute::new(PROTECTED, ValueKind::String, "Writable under lock only")
                    .lock_protected(),
            ),
    );
    registry.register(
        Schema::new(TEST_NEWEST)
            .with_retention(Retention::KeepNewest)
            .with_attribute(stored()),
    );
    registry.register(
        Schema::new(TEST_CLIENT)
            .with_attribute(Attribute::new(HOSTNAME, ValueKind::String, "Client host name")),
    );
    registry.register(
        Schema::new(TEST_FILE).with_attribute(Attribute::new(PATH, ValueKind::String, "File path")),
    );
    registry
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
