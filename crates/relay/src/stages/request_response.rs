use crate::bus::Message;
use crate::definition::{IoLane, IoLaneType};
use crate::event::{Event, Status};
use crate::joiner::{Correlation, RequestResponseJoiner};
use crate::options::ConfigKey;
use crate::stage::{Stage, StageContext};
use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_TIMEOUT_MS: i64 = 2_000;

/// Answers INTERACTIVE requests by publishing them on the request lane and
/// waiting for the correlated event on the response lane.
///
/// The request lane is the first EVENT output lane and the response lane
/// the first EVENT input lane, unless section `join` names them with
/// `requestLane` and `responseLane`. A response correlates when its path
/// carries the token this stage appended to that request's path, so
/// concurrent requests each get their own response.
#[derive(Debug, Default)]
pub struct RequestResponseJoinProcessor;

fn pick_lane<'a>(
    mut lanes: impl Iterator<Item = &'a IoLane>,
    named: Option<&str>,
    role: &str,
) -> anyhow::Result<&'a IoLane> {
    match named {
        Some(name) => lanes
            .find(|lane| lane.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("{role} lane '{name}' is not an EVENT lane of this stage")),
        None => lanes.next().ok_or_else(|| anyhow!("no EVENT lane for {role}s")),
    }
}

#[async_trait]
impl Stage for RequestResponseJoinProcessor {
    async fn start(&mut self, ctx: &StageContext) -> anyhow::Result<()> {
        let block = ctx.opts().section(ConfigKey::JOIN.key).block();
        let request_lane = pick_lane(
            ctx.output_lanes(IoLaneType::Event),
            block.get_string(ConfigKey::REQUEST_LANE.key).as_deref(),
            "request",
        )?;
        let response_lane = pick_lane(
            ctx.input_lanes(IoLaneType::Event),
            block.get_string(ConfigKey::RESPONSE_LANE.key).as_deref(),
            "response",
        )?;
        let timeout_ms: i64 = block.get_or(ConfigKey::TIMEOUT.key, DEFAULT_TIMEOUT_MS);

        let joiner = RequestResponseJoiner::new(
            ctx.bus().clone(),
            ctx.address(&request_lane.name),
            ctx.address(&response_lane.name),
        )
        .with_timeout(Duration::from_millis(timeout_ms.max(1).unsigned_abs()))
        .with_options(ctx.delivery_options());
        debug!(
            instance = %ctx.instance_name(),
            request = %request_lane.name,
            response = %response_lane.name,
            timeout_ms,
            "request/response join"
        );

        let out = ctx.clone();
        let lanes = ctx.subscribe(IoLaneType::Interactive, move |message: Message| {
            let token = Uuid::new_v4().to_string();
            let joiner = joiner
                .clone()
                .with_correlation(Correlation::Path(token.clone()));
            let out = out.clone();
            // One task per outstanding request.
            tokio::spawn(async move {
                let source = message.event();
                let request = out
                    .derive(
                        source,
                        Event::with_body(source.body().clone(), source.content_type()),
                    )
                    .add_path(token);
                match joiner.run(request).await {
                    Ok(response) => {
                        message.reply(response);
                    }
                    Err(e) => {
                        warn!(instance = %out.instance_name(), error = %e, "no correlated response");
                        message.fail(Status::InternalServerError.code(), e.to_string());
                    }
                }
            });
            async {}
        });
        if lanes == 0 {
            warn!(instance = %ctx.instance_name(), "no INTERACTIVE input lane");
        }
        Ok(())
    }
}
