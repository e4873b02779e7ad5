//! Built-in stage types.
//!
//! [`default_catalog`] registers every built-in under its type name. The
//! state machine processor needs an automaton engine from the embedding
//! application and is registered by [`crate::RuntimeBuilder::with_automaton`].

mod counter;
mod dummy;
mod event_log_sink;
mod join_processor;
mod periodic_trigger;
mod request_response;
mod stage_provider;

pub use counter::Counter;
pub use dummy::Dummy;
pub use event_log_sink::EventLogSink;
pub use join_processor::JoinProcessor;
pub use periodic_trigger::PeriodicTrigger;
pub use request_response::RequestResponseJoinProcessor;
pub use stage_provider::StageProvider;

use crate::definition::StageDefinition;
use crate::error::Result;
use crate::stage::{Stage, StageCatalog};

pub const EVENT_LOG_SINK: &str = "core.EventLogSink";
pub const PERIODIC_TRIGGER: &str = "core.PeriodicTrigger";
pub const COUNTER: &str = "core.Counter";
pub const JOIN_PROCESSOR: &str = "core.JoinProcessor";
pub const REQUEST_RESPONSE_JOIN_PROCESSOR: &str = "core.RequestResponseJoinProcessor";
pub const STAGE_PROVIDER: &str = "core.StageProvider";
pub const DUMMY: &str = "core.Dummy";
pub const HSM_PROCESSOR: &str = "core.HsmProcessor";

fn factory<S: Stage + Default>(_definition: &StageDefinition) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = Box::<S>::default();
    Ok(stage)
}

/// Catalog with every built-in stage type.
pub fn default_catalog() -> StageCatalog {
    StageCatalog::new()
        .with_stage(EVENT_LOG_SINK, factory::<EventLogSink>)
        .with_stage(PERIODIC_TRIGGER, factory::<PeriodicTrigger>)
        .with_stage(COUNTER, factory::<Counter>)
        .with_stage(JOIN_PROCESSOR, factory::<JoinProcessor>)
        .with_stage(REQUEST_RESPONSE_JOIN_PROCESSOR, factory::<RequestResponseJoinProcessor>)
        .with_stage(STAGE_PROVIDER, factory::<StageProvider>)
        .with_stage(DUMMY, factory::<Dummy>)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_builtins() {
        let catalog = default_catalog();
        for stage_type in [
            EVENT_LOG_SINK,
            PERIODIC_TRIGGER,
            COUNTER,
            JOIN_PROCESSOR,
            REQUEST_RESPONSE_JOIN_PROCESSOR,
            STAGE_PROVIDER,
            DUMMY,
        ] {
            assert!(catalog.contains(stage_type), "{stage_type}");
        }
        assert!(!catalog.contains(HSM_PROCESSOR));
    }
}
