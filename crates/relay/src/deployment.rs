//! Turning stage definitions into running stages.
//!
//! [`Deployment::deploy`] checks the blacklist first, then dispatches on
//! the deployment type:
//!
//! - `LOCAL`: instantiate `instances` copies in this process, sharing one
//!   deployment id, and start them. The call resolves with the outcome.
//! - `SINGLE`: send the definition to one listener on [`DEPLOY_ADDRESS`].
//! - `GLOBAL`: publish the definition to every listener on it.
//!
//! Forwarded deployments resolve as soon as the control event is handed to
//! the bus; they say nothing about the remote outcome.

use crate::bus::{DeliveryOptions, EventBus};
use crate::codec::{decode_frame, encode_frame};
use crate::definition::{DeploymentType, StageDefinition};
use crate::error::{RelayError, Result};
use crate::event::{ContentType, Event};
use crate::registry::{Deployed, Registry, RunningStage};
use crate::stage::{StageCatalog, StageContext};
use futures::future::join_all;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Control address consumed by [`crate::Deployer`].
pub const DEPLOY_ADDRESS: &str = "relay.deploy";

/// Result of a successful deploy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Started locally under this deployment id.
    Deployed { deployment_id: String },
    /// Handed to the deploy address.
    Forwarded(DeploymentType),
}

impl DeployOutcome {
    pub fn deployment_id(&self) -> Option<&str> {
        match self {
            DeployOutcome::Deployed { deployment_id } => Some(deployment_id),
            DeployOutcome::Forwarded(_) => None,
        }
    }
}

/// Compiled blacklist patterns. A pattern must match a whole instance name
/// or stage type.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    patterns: Vec<Regex>,
}

impl Blacklist {
    /// Compiles `patterns`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] for an invalid pattern.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("^(?:{p})$"))
                    .map_err(|e| RelayError::config(format!("invalid blacklist pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }

    pub fn rejects(&self, definition: &StageDefinition) -> bool {
        self.matches(&definition.instance_name) || self.matches(&definition.stage_type)
    }
}

/// Wraps a definition in a control event: a framed body tagged binary.
pub fn definition_event(definition: &StageDefinition) -> Result<Event> {
    let frame = encode_frame(definition)?;
    Ok(Event::with_body(frame, ContentType::Binary))
}

/// Reads the definition carried by a control event.
pub fn definition_from_event(event: &Event) -> Result<StageDefinition> {
    let mut body = event.body().clone();
    decode_frame(&mut body)
}

struct DeploymentInner {
    bus: EventBus,
    catalog: StageCatalog,
    registry: Arc<Registry>,
    blacklist: Blacklist,
    settings: Arc<serde_json::Value>,
}

/// Deploys and undeploys stages. Cloning is cheap.
#[derive(Clone)]
pub struct Deployment {
    inner: Arc<DeploymentInner>,
}

impl Deployment {
    pub fn new(
        bus: EventBus,
        catalog: StageCatalog,
        registry: Arc<Registry>,
        blacklist: Blacklist,
        settings: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            inner: Arc::new(DeploymentInner {
                bus,
                catalog,
                registry,
                blacklist,
                settings,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.inner.catalog
    }

    pub fn settings(&self) -> &Arc<serde_json::Value> {
        &self.inner.settings
    }

    /// Deploys with the definition's own deployment type.
    pub async fn deploy(&self, definition: &StageDefinition) -> Result<DeployOutcome> {
        self.deploy_as(definition, definition.deployment_type).await
    }

    /// Deploys with an explicit deployment type.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Blacklisted`] without attempting anything else
    /// - [`RelayError::UnknownStageType`], [`RelayError::StageStart`] and
    ///   option errors for local deployments
    /// - [`RelayError::NoHandlers`] when a `SINGLE` deployment has no
    ///   deployer to forward to
    pub async fn deploy_as(
        &self,
        definition: &StageDefinition,
        deployment_type: DeploymentType,
    ) -> Result<DeployOutcome> {
        debug!(
            instance = %definition.instance_name,
            stage_type = %definition.stage_type,
            ?deployment_type,
            "deploying"
        );
        if self.inner.blacklist.rejects(definition) {
            info!(
                instance = %definition.instance_name,
                stage_type = %definition.stage_type,
                "blacklisted"
            );
            return Err(RelayError::Blacklisted {
                instance_name: definition.instance_name.clone(),
                stage_type: definition.stage_type.clone(),
            });
        }

        match deployment_type {
            DeploymentType::Local => {
                let deployment_id = self.deploy_local(definition).await?;
                Ok(DeployOutcome::Deployed { deployment_id })
            }
            DeploymentType::Single => {
                let event = definition_event(definition)?;
                self.inner
                    .bus
                    .send(DEPLOY_ADDRESS, &event, &DeliveryOptions::new())?;
                Ok(DeployOutcome::Forwarded(DeploymentType::Single))
            }
            DeploymentType::Global => {
                let event = definition_event(definition)?;
                let reached = self
                    .inner
                    .bus
                    .publish(DEPLOY_ADDRESS, &event, &DeliveryOptions::new());
                if reached == 0 {
                    warn!(instance = %definition.instance_name, "no deployers listening");
                }
                Ok(DeployOutcome::Forwarded(DeploymentType::Global))
            }
        }
    }

    async fn deploy_local(&self, definition: &StageDefinition) -> Result<String> {
        definition.validate()?;
        let definition = Arc::new(definition.clone());
        let deployment_id = Uuid::new_v4().to_string();
        let count = definition.instances.max(1);
        debug!(
            instance = %definition.instance_name,
            instances = count,
            worker = definition.worker,
            ha = definition.high_availability,
            "starting instances"
        );

        let mut started: Vec<RunningStage> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.start_instance(&deployment_id, &definition).await {
                Ok(running) => started.push(running),
                Err(e) => {
                    error!(instance = %definition.instance_name, error = %e, "deployment failed");
                    stop_instances(started).await;
                    return Err(e);
                }
            }
        }

        self.inner.registry.insert(Deployed {
            deployment_id: deployment_id.clone(),
            definition: definition.clone(),
            instances: started,
        });
        info!(
            instance = %definition.instance_name,
            stage_type = %definition.stage_type,
            deployment = %deployment_id,
            "deployed"
        );
        Ok(deployment_id)
    }

    async fn start_instance(
        &self,
        deployment_id: &str,
        definition: &Arc<StageDefinition>,
    ) -> Result<RunningStage> {
        let context = StageContext::new(
            deployment_id,
            definition.clone(),
            self.inner.bus.clone(),
            self.inner.settings.clone(),
        )?;
        let mut stage = self.inner.catalog.create(definition)?;
        if let Err(e) = stage.start(&context).await {
            context.stop_consumers();
            return Err(RelayError::StageStart {
                instance_name: definition.instance_name.clone(),
                message: format!("{e:#}"),
            });
        }
        Ok(RunningStage { context, stage })
    }

    /// Stops every instance of a deployment and removes its consumers.
    pub async fn undeploy(&self, deployment_id: &str) -> Result<()> {
        let deployed = self
            .inner
            .registry
            .take(deployment_id)
            .ok_or_else(|| RelayError::UnknownDeployment(deployment_id.to_string()))?;
        info!(
            instance = %deployed.definition.instance_name,
            deployment = %deployment_id,
            "undeploying"
        );
        stop_instances(deployed.instances).await;
        Ok(())
    }

    /// Undeploys everything tracked by the registry.
    pub async fn undeploy_all(&self) {
        let ids = self.inner.registry.deployment_ids();
        let results = join_all(ids.iter().map(|id| self.undeploy(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(deployment = %id, error = %e, "undeploy failed");
            }
        }
    }
}

async fn stop_instances(instances: Vec<RunningStage>) {
    for RunningStage { context, mut stage } in instances {
        if let Err(e) = stage.stop(&context).await {
            warn!(instance = %context.instance_name(), error = %e, "stage stop failed");
        }
        context.stop_consumers();
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("catalog", &self.inner.catalog)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::IoLane;
    use crate::stage::Stage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        starts: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for Tracked {
        async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            ctx.subscribe(crate::definition::IoLaneType::Event, |_m| async {});
            if self.fail {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }
    }

    fn deployment(blacklist: &[&str], starts: Arc<AtomicUsize>) -> Deployment {
        let catalog = StageCatalog::new()
            .with_stage("test.Tracked", {
                let starts = starts.clone();
                move |_def: &StageDefinition| {
                    Ok(Box::new(Tracked {
                        starts: starts.clone(),
                        fail: false,
                    }) as Box<dyn Stage>)
                }
            })
            .with_stage("test.Failing", move |_def: &StageDefinition| {
                Ok(Box::new(Tracked {
                    starts: starts.clone(),
                    fail: true,
                }) as Box<dyn Stage>)
            });
        Deployment::new(
            EventBus::new(),
            catalog,
            Arc::new(Registry::new()),
            Blacklist::new(blacklist).unwrap(),
            Arc::new(serde_json::json!({})),
        )
    }

    fn tracked_definition(name: &str) -> StageDefinition {
        StageDefinition::new("ns", name, "test.Tracked").with_input_lane(IoLane::event("in"))
    }

    #[test]
    fn blacklist_requires_a_full_match() {
        let blacklist = Blacklist::new(["Shell.*", "core\\.Exec"]).unwrap();
        assert!(blacklist.matches("Shell_01"));
        assert!(!blacklist.matches("MyShell"));
        assert!(blacklist.matches("core.Exec"));
        assert!(!blacklist.matches("core.Executor"));
        assert!(Blacklist::new(["("]).is_err());
    }

    #[tokio::test]
    async fn blacklisted_definitions_are_never_instantiated() {
        let starts = Arc::new(AtomicUsize::new(0));
        let deployment = deployment(&["test\\..*"], starts.clone());

        let err = deployment.deploy(&tracked_definition("A")).await.unwrap_err();
        assert!(matches!(err, RelayError::Blacklisted { .. }));
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(deployment.registry().is_empty());
    }

    #[tokio::test]
    async fn local_deploy_starts_every_instance_under_one_id() {
        let starts = Arc::new(AtomicUsize::new(0));
        let deployment = deployment(&[], starts.clone());

        let outcome = deployment
            .deploy(&tracked_definition("A").with_instances(3))
            .await
            .unwrap();
        let id = outcome.deployment_id().unwrap().to_string();

        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert_eq!(deployment.registry().instance_count(&id), 3);
        assert_eq!(deployment.bus().consumer_count("ns::in"), 3);
        assert_eq!(deployment.registry().record("A").unwrap().deployment_id, id);

        deployment.undeploy(&id).await.unwrap();
        assert_eq!(deployment.bus().consumer_count("ns::in"), 0);
        assert!(matches!(
            deployment.undeploy(&id).await,
            Err(RelayError::UnknownDeployment(_))
        ));
    }

    #[tokio::test]
    async fn failed_start_rolls_back() {
        let starts = Arc::new(AtomicUsize::new(0));
        let deployment = deployment(&[], starts.clone());
        let definition = StageDefinition::new("ns", "F", "test.Failing")
            .with_input_lane(IoLane::event("in"));

        let err = deployment.deploy(&definition).await.unwrap_err();
        assert!(matches!(err, RelayError::StageStart { .. }));
        assert_eq!(deployment.bus().consumer_count("ns::in"), 0);
        assert!(deployment.registry().is_empty());

        let unknown = StageDefinition::new("ns", "U", "test.Nope");
        assert!(matches!(
            deployment.deploy(&unknown).await,
            Err(RelayError::UnknownStageType(_))
        ));
    }

    #[tokio::test]
    async fn forwarded_deployments_resolve_immediately() {
        let deployment = deployment(&[], Arc::new(AtomicUsize::new(0)));
        let mut listener = deployment.bus().consumer(DEPLOY_ADDRESS);

        let definition = tracked_definition("R").with_deployment_type(DeploymentType::Global);
        assert_eq!(
            deployment.deploy(&definition).await.unwrap(),
            DeployOutcome::Forwarded(DeploymentType::Global)
        );
        let message = listener.recv().await.unwrap();
        assert_eq!(definition_from_event(message.event()).unwrap(), definition);
        assert!(deployment.registry().is_empty());
    }

    #[tokio::test]
    async fn single_without_deployer_is_an_error() {
        let deployment = deployment(&[], Arc::new(AtomicUsize::new(0)));
        let definition = tracked_definition("S").with_deployment_type(DeploymentType::Single);
        assert!(matches!(
            deployment.deploy(&definition).await,
            Err(RelayError::NoHandlers(_))
        ));
    }
}
