//! State machine glue.
//!
//! [`HsmProcessor`] turns events on its EVENT input lanes into automaton
//! events and publishes the actions of whatever transitions fire. The
//! automaton engine itself is supplied by the embedding application through
//! an [`AutomatonFactory`]; this module only reads the machine description
//! from the stage options and maps lanes to events and transitions to
//! output events.
//!
//! ```yaml
//! options:
//!   - section: states
//!     state: S1
//!     initialState: true
//!   - section: states
//!     state: S2
//!     entryAction: out_01::entered::TEXT
//!   - section: transitions
//!     source: S1
//!     target: S2
//!     event: E1
//!     action: out_01::true::BOOL
//!   - section: events
//!     lane: inputLane01
//!     event: E1
//! ```

use crate::bus::Message;
use crate::definition::{IoLaneType, StageDefinition};
use crate::error::{RelayError, Result};
use crate::event::{ContentType, Event};
use crate::lane::{lane_name_from_address, ADDRESS_SEPARATOR};
use crate::options::{Block, ConfigKey, StageOptions};
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ============================================================================
// Machine description
// ============================================================================

/// An output event published when a state is entered or left, or a
/// transition fires.
///
/// The compact form is `"lane::payload::type"`; the type is a content type
/// name and defaults to TEXT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionAction {
    /// Output lane; `None` makes the action a no-op.
    pub lane: Option<String>,
    pub payload: String,
    pub content_type: ContentType,
}

impl TransitionAction {
    pub fn new(lane: Option<String>, payload: impl Into<String>, type_name: Option<&str>) -> Self {
        Self {
            lane: lane.filter(|l| !l.is_empty()),
            payload: payload.into(),
            content_type: ContentType::from_name(type_name, ContentType::Text),
        }
    }

    /// Parses `"lane::payload::type"`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] when the payload part is missing.
    pub fn parse(action: &str) -> Result<Self> {
        let mut parts = action.splitn(3, ADDRESS_SEPARATOR);
        let lane = parts.next().map(str::to_string);
        let payload = parts
            .next()
            .ok_or_else(|| RelayError::config(format!("action payload is not defined: '{action}'")))?;
        Ok(Self::new(lane, payload, parts.next()))
    }

    /// Reads `action`, or `actionAddress` + `actionPayload` + `actionType`.
    fn from_block(block: &Block) -> Result<Option<Self>> {
        if let Some(action) = block.get_string("action") {
            return Self::parse(&action).map(Some);
        }
        let Some(lane) = block.get_string("actionAddress") else {
            return Ok(None);
        };
        let payload = block
            .get_string("actionPayload")
            .ok_or_else(|| RelayError::config("action payload is not defined"))?;
        let type_name = block.get_string("actionType");
        Ok(Some(Self::new(Some(lane), payload, type_name.as_deref())))
    }

    pub fn to_event(&self) -> Event {
        Event::with_body(self.payload.clone(), self.content_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSpec {
    pub state: String,
    pub parent: Option<String>,
    pub initial: bool,
    pub terminal: bool,
    pub entry_action: Option<TransitionAction>,
    pub exit_action: Option<TransitionAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSpec {
    pub source: String,
    pub target: String,
    pub event: String,
    pub action: Option<TransitionAction>,
}

/// States and transitions read from the `states` and `transitions`
/// sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineSpec {
    pub states: Vec<StateSpec>,
    pub transitions: Vec<TransitionSpec>,
}

impl MachineSpec {
    /// # Errors
    ///
    /// [`RelayError::Config`] for a state without a name, a transition
    /// missing its source, target or event, or a malformed action.
    pub fn from_options(opts: &StageOptions) -> Result<Self> {
        let states = opts
            .section(ConfigKey::STATES.key)
            .blocks
            .iter()
            .map(|block| {
                let state = block
                    .get_string("state")
                    .ok_or_else(|| RelayError::config("no state found in the states block"))?;
                let action = |key: &str| block.get_string(key).map(|a| TransitionAction::parse(&a)).transpose();
                Ok(StateSpec {
                    state,
                    parent: block.get_string("parent"),
                    initial: block.get_or("initialState", false),
                    terminal: block.get_or("finalState", false),
                    entry_action: action("entryAction")?,
                    exit_action: action("exitAction")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let transitions = opts
            .section(ConfigKey::TRANSITIONS.key)
            .blocks
            .iter()
            .map(|block| {
                let required = |key: &str| {
                    block.get_string(key).ok_or_else(|| {
                        RelayError::config(format!("{key} is not defined for a transitions block"))
                    })
                };
                Ok(TransitionSpec {
                    source: required("source")?,
                    target: required("target")?,
                    event: required("event")?,
                    action: TransitionAction::from_block(block)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            states,
            transitions,
        })
    }

    fn state(&self, name: &str) -> Option<&StateSpec> {
        self.states.iter().find(|s| s.state == name)
    }

    /// Actions to publish for a fired transition: the source's exit action,
    /// the transition's own action, then the target's entry action.
    pub fn actions_for(&self, fired: &Transition) -> Vec<&TransitionAction> {
        let exit = self.state(&fired.source).and_then(|s| s.exit_action.as_ref());
        let own = self
            .transitions
            .iter()
            .find(|t| t.source == fired.source && t.target == fired.target && t.event == fired.event)
            .and_then(|t| t.action.as_ref());
        let entry = self.state(&fired.target).and_then(|s| s.entry_action.as_ref());
        [exit, own, entry].into_iter().flatten().collect()
    }
}

/// Maps an input lane to an automaton event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMapping {
    pub lane: String,
    pub event: Option<String>,
}

impl EventMapping {
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or(&self.lane)
    }
}

/// One mapping per EVENT input lane; lanes without an `events` block map
/// to their own name.
pub fn event_mappings(definition: &StageDefinition, opts: &StageOptions) -> HashMap<String, EventMapping> {
    let events = opts.section(ConfigKey::EVENTS.key);
    definition
        .input_lanes
        .iter()
        .filter(|lane| lane.lane_type == IoLaneType::Event)
        .map(|lane| {
            let event = events
                .blocks
                .iter()
                .find(|b| b.get_string("lane").as_deref() == Some(lane.name.as_str()))
                .and_then(|b| b.get_string("event"));
            (
                lane.name.clone(),
                EventMapping {
                    lane: lane.name.clone(),
                    event,
                },
            )
        })
        .collect()
}

// ============================================================================
// Automaton seam
// ============================================================================

/// A transition reported by the automaton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub source: String,
    pub target: String,
    pub event: String,
}

/// A state machine engine.
pub trait Automaton: Send + 'static {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    /// Feeds one event and returns the transitions it fired.
    fn send_event(&mut self, event: &str) -> Vec<Transition>;
}

/// Builds an automaton for a machine description.
pub type AutomatonFactory = Arc<dyn Fn(&MachineSpec) -> anyhow::Result<Box<dyn Automaton>> + Send + Sync>;

// ============================================================================
// Stage
// ============================================================================

pub struct HsmProcessor {
    factory: AutomatonFactory,
    automaton: Option<Arc<Mutex<Box<dyn Automaton>>>>,
}

impl HsmProcessor {
    pub fn new(factory: AutomatonFactory) -> Self {
        Self {
            factory,
            automaton: None,
        }
    }
}

#[async_trait]
impl Stage for HsmProcessor {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let spec = Arc::new(MachineSpec::from_options(ctx.opts())?);
        let mappings = event_mappings(ctx.definition(), ctx.opts());
        debug!(
            instance = %ctx.instance_name(),
            states = spec.states.len(),
            transitions = spec.transitions.len(),
            "state machine"
        );

        let mut automaton = (self.factory)(&spec)?;
        automaton.start();
        let automaton = Arc::new(Mutex::new(automaton));
        self.automaton = Some(automaton.clone());

        let out = ctx.clone();
        ctx.subscribe(IoLaneType::Event, move |message: Message| {
            let lane = lane_name_from_address(message.address());
            match mappings.get(lane) {
                Some(mapping) => {
                    let event = mapping.event_name();
                    let fired = automaton.lock().send_event(event);
                    trace!(lane, event, fired = fired.len(), "automaton event");
                    for transition in &fired {
                        for action in spec.actions_for(transition) {
                            publish_action(&out, message.event(), action);
                        }
                    }
                }
                None => warn!(lane, "no event mapping"),
            }
            async {}
        });
        Ok(())
    }

    async fn stop(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
        if let Some(automaton) = self.automaton.take() {
            automaton.lock().stop();
        }
        Ok(())
    }
}

fn publish_action(ctx: &StageContext, source: &Event, action: &TransitionAction) {
    let Some(lane) = &action.lane else {
        trace!("empty action");
        return;
    };
    let event = ctx.derive(source, action.to_event());
    if let Err(e) = ctx.publish_to(lane, &event) {
        warn!(instance = %ctx.instance_name(), lane = %lane, error = %e, "action not published");
    }
}

impl std::fmt::Debug for HsmProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmProcessor")
            .field("started", &self.automaton.is_some())
            .finish()
    }
}
