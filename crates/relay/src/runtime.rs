//! Process wiring.
//!
//! [`RuntimeBuilder`] assembles the bus, the stage catalog, the deployment
//! component and the deployer from a [`RuntimeConfig`], then boots the
//! built-in and user documents.
//!
//! ```ignore
//! let runtime = RuntimeBuilder::new(ConfigLoader::new().load()?)
//!     .with_stage("app.Upper", |_d: &StageDefinition| Ok(Box::new(Upper) as Box<dyn Stage>))
//!     .build()
//!     .await?;
//!
//! runtime.deploy_document("inline", yaml).await?;
//! runtime.shutdown().await;
//! ```

use crate::boot::{boot, BootReport};
use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::definition::StageDefinition;
use crate::deployer::Deployer;
use crate::deployment::{Blacklist, DeployOutcome, Deployment};
use crate::error::Result;
use crate::hsm::{Automaton, AutomatonFactory, HsmProcessor, MachineSpec};
use crate::registry::Registry;
use crate::stage::{Stage, StageCatalog};
use crate::stages::{default_catalog, HSM_PROCESSOR};
use std::sync::Arc;
use tracing::info;

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    catalog: StageCatalog,
    boot: bool,
}

impl RuntimeBuilder {
    /// Builder with the built-in stage catalog.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            catalog: default_catalog(),
            boot: true,
        }
    }

    /// Registers a stage type, replacing any built-in of the same name.
    #[must_use]
    pub fn with_stage<F>(mut self, stage_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&StageDefinition) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.catalog.register(stage_type, factory);
        self
    }

    /// Enables `core.HsmProcessor` with the given automaton engine.
    #[must_use]
    pub fn with_automaton<F>(mut self, factory: F) -> Self
    where
        F: Fn(&MachineSpec) -> anyhow::Result<Box<dyn Automaton>> + Send + Sync + 'static,
    {
        let factory: AutomatonFactory = Arc::new(factory);
        self.catalog.register(HSM_PROCESSOR, move |_definition: &StageDefinition| {
            let stage: Box<dyn Stage> = Box::new(HsmProcessor::new(factory.clone()));
            Ok(stage)
        });
        self
    }

    /// Skips boot entirely; nothing is deployed until asked.
    #[must_use]
    pub fn without_boot(mut self) -> Self {
        self.boot = false;
        self
    }

    /// Wires the runtime and runs boot.
    ///
    /// # Errors
    ///
    /// Fails only when the blacklist does not compile. Individual boot
    /// documents never fail the build; see [`Runtime::boot_report`].
    pub async fn build(self) -> Result<Runtime> {
        let blacklist = Blacklist::new(&self.config.blacklist)?;
        let bus = EventBus::configured(self.config.wire_codec, self.config.request_timeout());
        let deployment = Deployment::new(
            bus.clone(),
            self.catalog,
            Arc::new(Registry::new()),
            blacklist,
            Arc::new(self.config.settings.clone()),
        );
        let deployer = Deployer::start(deployment.clone());

        let boot_report = if self.boot {
            boot(&deployment, &self.config).await
        } else {
            BootReport::default()
        };
        info!(
            deployed = deployment.registry().len(),
            wire_codec = self.config.wire_codec,
            "runtime started"
        );

        Ok(Runtime {
            config: self.config,
            bus,
            deployment,
            deployer,
            boot_report,
        })
    }
}

/// A running process: bus, deployments and the deployer.
pub struct Runtime {
    config: RuntimeConfig,
    bus: EventBus,
    deployment: Deployment,
    deployer: Deployer,
    boot_report: BootReport,
}

impl Runtime {
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.deployment.registry()
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    pub fn boot_report(&self) -> &BootReport {
        &self.boot_report
    }

    pub async fn deploy(&self, definition: &StageDefinition) -> Result<DeployOutcome> {
        self.deployment.deploy(definition).await
    }

    /// Renders and parses a YAML document, then deploys it.
    pub async fn deploy_document(&self, name: &str, body: &str) -> Result<DeployOutcome> {
        let definition = StageDefinition::from_template(name, body, &self.config.settings)?;
        self.deploy(&definition).await
    }

    pub async fn undeploy(&self, deployment_id: &str) -> Result<()> {
        self.deployment.undeploy(deployment_id).await
    }

    /// Stops the deployer and undeploys everything.
    pub async fn shutdown(self) {
        self.deployer.stop();
        self.deployment.undeploy_all().await;
        info!("runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("bus", &self.bus)
            .field("deployment", &self.deployment)
            .field("boot_report", &self.boot_report)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryOptions;
    use crate::error::RelayError;
    use crate::event::Event;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            user_stages: "/no/such/stages".into(),
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn boots_builtin_stages() {
        let runtime = RuntimeBuilder::new(config()).build().await.unwrap();
        assert!(runtime.boot_report().is_clean());
        assert_eq!(runtime.boot_report().deployed, vec!["EventLogSink_01", "StageProvider_01"]);
        assert!(runtime.bus().has_consumers("core::log"));

        let stages = runtime
            .bus()
            .request("core::get_core_stages", &Event::empty(), &DeliveryOptions::new())
            .await
            .unwrap();
        assert!(stages.payload_as_json().unwrap().is_array());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn noboot_and_without_boot() {
        let noboot = RuntimeBuilder::new(RuntimeConfig {
            noboot: true,
            ..config()
        })
        .build()
        .await
        .unwrap();
        assert!(noboot.registry().is_empty());

        let bare = RuntimeBuilder::new(config()).without_boot().build().await.unwrap();
        assert!(bare.registry().is_empty());
    }

    #[tokio::test]
    async fn invalid_blacklist_fails_build() {
        let result = RuntimeBuilder::new(RuntimeConfig {
            blacklist: vec!["(".into()],
            ..config()
        })
        .build()
        .await;
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn deploy_document_renders_settings() {
        let runtime = RuntimeBuilder::new(RuntimeConfig {
            settings: serde_json::json!({ "ns": "tenant" }),
            ..config()
        })
        .without_boot()
        .build()
        .await
        .unwrap();

        let outcome = runtime
            .deploy_document(
                "inline",
                "namespace: \"{{ config.ns }}\"\ninstanceName: D\ntype: core.Dummy\n",
            )
            .await
            .unwrap();
        let id = outcome.deployment_id().unwrap().to_string();
        assert_eq!(runtime.registry().definition("D").unwrap().namespace, "tenant");

        runtime.undeploy(&id).await.unwrap();
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn hsm_needs_an_automaton() {
        let runtime = RuntimeBuilder::new(config()).without_boot().build().await.unwrap();
        let definition = StageDefinition::new("ns", "Hsm", HSM_PROCESSOR);
        assert!(matches!(
            runtime.deploy(&definition).await,
            Err(RelayError::UnknownStageType(_))
        ));
    }
}
