//! # Relay
//!
//! A declarative dataflow runtime: independently deployable stages, wired
//! together by typed lanes over an in-memory event bus.
//!
//! ## Core Concepts
//!
//! - [`Event`] = the immutable envelope (id, timestamp, provenance path,
//!   headers, body)
//! - [`StageDefinition`] = a topology document describing one stage
//! - [`Stage`] = the code behind a stage type, started with a
//!   [`StageContext`]
//! - Lanes = named, typed channels. A lane resolves to the bus address
//!   `namespace::lane`
//!
//! ## Architecture
//!
//! ```text
//! YAML document ──► template pre-pass ──► StageDefinition
//!                                              │
//!                                              ▼ deploy()
//!                                         Deployment ── blacklist
//!                                              │
//!              ┌───────────────────────────────┼─────────────────┐
//!              │ LOCAL                         │ SINGLE          │ GLOBAL
//!              ▼                               ▼                 ▼
//!        StageCatalog.create()          send(relay.deploy)  publish(relay.deploy)
//!              │                               │                 │
//!              ▼                               └──► Deployer ◄───┘
//!        Stage.start(ctx)
//!              │
//!              ├─► ctx.subscribe(EVENT | INTERACTIVE) ◄── EventBus
//!              └─► ctx.publish() / ctx.send() ────────►  EventBus
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Paths only grow** - every hop appends exactly one stage id
//! 2. **Reads never fail** - typed option accessors fall back to defaults
//! 3. **Every wait is bounded** - requests, joiners and windows carry timers
//! 4. **No consumer outlives its stage** - stop unregisters everything
//! 5. **Boot always completes** - a bad document is logged and skipped
//!
//! ## Delivery
//!
//! - EVENT lanes broadcast to every consumer, or to one consumer in strict
//!   round-robin order when flagged `p2p`
//! - INTERACTIVE lanes are request/reply with a single responder
//! - Ordering across subscribers is unspecified; use the correlation
//!   primitives ([`RequestResponseJoiner`], [`EventWindow`]) instead
//!
//! ## Example
//!
//! ```ignore
//! use relay_core::{
//!     async_trait, ConfigLoader, Event, IoLaneType, Message, RuntimeBuilder, Stage,
//!     StageContext, StageDefinition,
//! };
//!
//! // 1. Define a stage
//! struct Upper;
//!
//! #[async_trait]
//! impl Stage for Upper {
//!     async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
//!         let out = ctx.clone();
//!         ctx.subscribe(IoLaneType::Event, move |message: Message| {
//!             let text = message.event().payload_as_string().to_uppercase();
//!             out.publish(&out.derive(message.event(), Event::text(text)));
//!             async {}
//!         });
//!         Ok(())
//!     }
//! }
//!
//! // 2. Wire the runtime and boot
//! let runtime = RuntimeBuilder::new(ConfigLoader::new().with_file("relay.yml").load()?)
//!     .with_stage("app.Upper", |_d: &StageDefinition| Ok(Box::new(Upper) as Box<dyn Stage>))
//!     .build()
//!     .await?;
//!
//! // 3. Deploy a document
//! runtime
//!     .deploy_document("upper", r#"
//! namespace: app
//! instanceName: Upper_01
//! type: app.Upper
//! inputLanes:
//!   - { type: EVENT, name: in }
//! outputLanes:
//!   - { type: EVENT, name: out }
//! "#)
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! Relay is **not**:
//! - A clustered transport (the bus is in-process)
//! - A state machine engine (see [`hsm`] for the glue)
//! - A persistence layer

// Core modules
mod boot;
mod bus;
mod codec;
mod coerce;
mod config;
mod definition;
mod deployer;
mod deployment;
mod error;
mod event;
mod joiner;
mod lane;
mod options;
mod queue;
mod registry;
mod runtime;
mod stage;
mod template;
mod value;
mod window;

// State machine glue
pub mod hsm;

// Built-in stage types
pub mod stages;

// Re-export error types
pub use crate::error::{RelayError, Result};

// Re-export value and option types
pub use crate::coerce::{
    as_binary, as_bool, as_char, as_double, as_float, as_int, as_int_list, as_list, as_long,
    as_long_list, as_map, as_string, as_string_list, as_string_map, FromValue,
};
pub use crate::options::{
    Block, ConfigKey, ConfigType, OptionRow, Section, StageOptions, DEFAULT_SECTION_NAME,
    SECTION_KEY,
};
pub use crate::value::{probe, ProbedType, Value};

// Re-export event types
pub use crate::event::{
    as_content_type, ContentType, Event, Payload, Status, CONTENT_TYPE_HEADER, FILE_PATH_HEADER,
    REPLY_TO_HEADER, STATUS_HEADER,
};

// Re-export wire codec
pub use crate::codec::{
    decode_frame, decode_frames, encode_frame, WireCodec, EVENT_SCHEMA, FRAME_HEADER_LEN,
};

// Re-export topology types
pub use crate::definition::{AgentConstraint, DeploymentType, IoLane, IoLaneType, StageDefinition};
pub use crate::lane::{address, lane_name_from_address, DeliveryMode, ADDRESS_SEPARATOR};
pub use crate::template::{render, CONFIG_VAR};

// Re-export bus types
pub use crate::bus::{
    reply_with_status, ConsumerHandle, DeliveryOptions, EventBus, Message, MessageConsumer,
    DEFAULT_REQUEST_TIMEOUT, ORIGIN_HEADER,
};

// Re-export stage types
pub use crate::stage::{Stage, StageCatalog, StageContext, StageFactory};

// Re-export deployment types
pub use crate::deployer::Deployer;
pub use crate::deployment::{
    definition_event, definition_from_event, Blacklist, DeployOutcome, Deployment, DEPLOY_ADDRESS,
};
pub use crate::registry::{Deployed, DeploymentRecord, Registry, RunningStage};

// Re-export boot types
pub use crate::boot::{
    boot, builtin_definitions, user_documents, BootFailure, BootReport, BUILTIN_DOCUMENTS,
    BUILTIN_PREFIX,
};

// Re-export correlation primitives
pub use crate::joiner::{Correlation, RequestResponseJoiner};
pub use crate::queue::{EventQueue, DEFAULT_QUEUE_SIZE, RESUME_LEVEL};
pub use crate::window::{EventWindow, WindowResult};

// Re-export runtime types
pub use crate::config::{
    ConfigLoader, RuntimeConfig, ENV_BLACKLIST, ENV_NOBOOT, ENV_REQUEST_TIMEOUT_MS,
    ENV_USER_STAGES, ENV_WIRE_CODEC,
};
pub use crate::runtime::{Runtime, RuntimeBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
