//! Control-address consumer for forwarded deployments.
//!
//! One deployer per process takes definitions sent or published to
//! [`DEPLOY_ADDRESS`] and deploys them locally. Failures are answered with
//! an error-status event instead of being raised; a requester that asked
//! for a reply also gets one on success, carrying the deployment id.

use crate::bus::{reply_with_status, ConsumerHandle, Message};
use crate::definition::DeploymentType;
use crate::deployment::{definition_from_event, Deployment, DEPLOY_ADDRESS};
use crate::event::{Event, Status};
use crate::registry::DeploymentRecord;
use tracing::{debug, error, info};

pub struct Deployer {
    deployment: Deployment,
    handle: ConsumerHandle,
}

impl Deployer {
    /// Starts consuming the control address.
    pub fn start(deployment: Deployment) -> Self {
        let worker = deployment.clone();
        let handle = deployment
            .bus()
            .consumer_with_handler(DEPLOY_ADDRESS, move |message: Message| {
                let deployment = worker.clone();
                async move { handle_request(&deployment, message).await }
            });
        debug!(address = DEPLOY_ADDRESS, "deployer listening");
        Self { deployment, handle }
    }

    /// Definitions deployed in this process, by instance name.
    pub fn deployed(&self) -> Vec<DeploymentRecord> {
        self.deployment.registry().records()
    }

    pub fn stop(&self) {
        self.handle.unregister();
    }
}

async fn handle_request(deployment: &Deployment, message: Message) {
    let definition = match definition_from_event(message.event()) {
        Ok(definition) => definition,
        Err(e) => {
            error!(error = %e, "unreadable deploy request");
            reply_with_status(message, Status::InternalServerError, e.to_string());
            return;
        }
    };

    match deployment.deploy_as(&definition, DeploymentType::Local).await {
        Ok(outcome) => {
            let id = outcome.deployment_id().unwrap_or_default().to_string();
            info!(instance = %definition.instance_name, deployment = %id, "deployed on request");
            message.reply(Event::text(id).with_status(Status::Created));
        }
        Err(e) => {
            error!(instance = %definition.instance_name, error = %e, "deploy request failed");
            reply_with_status(message, Status::InternalServerError, e.to_string());
        }
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeliveryOptions, EventBus};
    use crate::definition::StageDefinition;
    use crate::deployment::{definition_event, Blacklist};
    use crate::registry::Registry;
    use crate::stage::{Stage, StageCatalog, StageContext};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Idle;

    #[async_trait]
    impl Stage for Idle {
        async fn start(&mut self, _ctx: &StageContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn deployer(blacklist: &[&str]) -> Deployer {
        let catalog = StageCatalog::new()
            .with_stage("test.Idle", |_d: &StageDefinition| Ok(Box::new(Idle) as Box<dyn Stage>));
        Deployer::start(Deployment::new(
            EventBus::new(),
            catalog,
            Arc::new(Registry::new()),
            Blacklist::new(blacklist).unwrap(),
            Arc::new(serde_json::json!({})),
        ))
    }

    #[tokio::test]
    async fn deploys_requests_and_tracks_by_instance_name() {
        let deployer = deployer(&[]);
        let bus = deployer.deployment.bus().clone();
        let definition = StageDefinition::new("ns", "Remote_01", "test.Idle");

        let reply = bus
            .request(DEPLOY_ADDRESS, &definition_event(&definition).unwrap(), &DeliveryOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.status(), Status::Created);

        let deployed = deployer.deployed();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].definition.instance_name, "Remote_01");
        assert_eq!(deployed[0].deployment_id, reply.payload_as_string());
    }

    #[tokio::test]
    async fn failures_reply_with_error_status() {
        let deployer = deployer(&["Remote.*"]);
        let bus = deployer.deployment.bus().clone();
        let definition = StageDefinition::new("ns", "Remote_02", "test.Idle");

        let reply = bus
            .request(DEPLOY_ADDRESS, &definition_event(&definition).unwrap(), &DeliveryOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.status(), Status::InternalServerError);
        assert!(reply.payload_as_string().contains("blacklisted"));
        assert!(deployer.deployed().is_empty());

        let garbage = bus
            .request(DEPLOY_ADDRESS, &Event::text("nonsense"), &DeliveryOptions::new())
            .await
            .unwrap();
        assert_eq!(garbage.status(), Status::InternalServerError);
    }

    #[tokio::test]
    async fn stop_unregisters_the_control_consumer() {
        let deployer = deployer(&[]);
        let bus = deployer.deployment.bus().clone();
        assert!(bus.has_consumers(DEPLOY_ADDRESS));
        deployer.stop();
        deployer.stop();
        assert!(!bus.has_consumers(DEPLOY_ADDRESS));
    }
}
