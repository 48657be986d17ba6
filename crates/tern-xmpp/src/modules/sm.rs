use tokio::time::Instant;
use tracing::{debug, info};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::sm::Nonza;

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::stream_management::{decode_nonza, failure_condition, is_nonza};
use crate::transport::TransportConnector;

async fn next_nonza<C: TransportConnector>(
    ctx: &mut ConnectionContext<C>,
) -> Result<(Nonza, Element), ConnectionError> {
    let reply = ctx.next_element().await?;
    if !is_nonza(&reply) {
        return Err(ConnectionError::StreamError(format!(
            "unexpected <{}/> during stream management negotiation",
            reply.name()
        )));
    }
    let nonza = decode_nonza(reply.clone())?;
    Ok((nonza, reply))
}

fn offered<C: TransportConnector>(ctx: &ConnectionContext<C>) -> Result<(), String> {
    if ctx.features().stream_management {
        Ok(())
    } else {
        Err("server does not offer stream management".to_string())
    }
}

/// XEP-0198 § 5: pick up the previous session instead of binding anew.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamResumption;

impl StreamResumption {
    async fn resume<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        let request = ctx
            .link()
            .with_session(|session| session.resume_request(Instant::now()))?;
        ctx.send_nonza(request).await?;

        match next_nonza(ctx).await? {
            (Nonza::Resumed(resumed), _) => {
                let h = resumed.h;
                let pending = ctx
                    .link()
                    .with_session(|session| session.on_resumed(resumed))?;
                ctx.mark_resumed();
                info!(h, pending, "stream resumed");
                Ok(TransitionOutcome::success(format!(
                    "resumed with {pending} stanzas to replay"
                )))
            }
            (Nonza::Failed(failed), element) => {
                let condition =
                    failure_condition(&element).unwrap_or_else(|| "unspecified".to_string());
                let undelivered = ctx
                    .link()
                    .with_session(|session| session.on_resume_failed(failed.h));
                debug!(%condition, undelivered = undelivered.len(), "resumption rejected");
                ctx.link().report_undelivered(undelivered);
                Ok(TransitionOutcome::failed(format!(
                    "server rejected resumption: {condition}"
                )))
            }
            (other, _) => Err(ConnectionError::StreamError(format!(
                "unexpected {other:?} in reply to <resume/>"
            ))),
        }
    }
}

impl ModuleRuntime for StreamResumption {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        if let Err(reason) = offered(ctx) {
            return Feasibility::Impossible(reason);
        }
        if !ctx
            .link()
            .with_session(|session| session.can_resume(Instant::now()))
        {
            return Feasibility::Impossible("no resumable session".to_string());
        }
        Feasibility::Possible
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.resume(ctx).await.into()
    }

    fn reset_state(&mut self) {}
}

/// XEP-0198 § 3: turn on acknowledgments for a freshly bound session.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnableStreamManagement;

impl EnableStreamManagement {
    async fn enable<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        // A window that closed during this walk leaves a stale session behind.
        ctx.link().abandon_resumable();
        let request = ctx.link().with_session(|session| session.request_enable())?;
        ctx.send_nonza(request).await?;

        let (reply, element) = match next_nonza(ctx).await {
            Ok(reply) => reply,
            Err(error) => {
                ctx.link().with_session(|session| session.on_enable_failed());
                return Err(error);
            }
        };

        match reply {
            Nonza::Enabled(enabled) => {
                ctx.link()
                    .with_session(|session| session.on_enabled(enabled))?;
                let resumable = ctx
                    .link()
                    .with_session(|session| session.stream_id().is_some());
                Ok(TransitionOutcome::success(if resumable {
                    "stream management enabled with resumption"
                } else {
                    "stream management enabled"
                }))
            }
            Nonza::Failed(_) => {
                ctx.link().with_session(|session| session.on_enable_failed());
                let condition =
                    failure_condition(&element).unwrap_or_else(|| "unspecified".to_string());
                Ok(TransitionOutcome::failed(format!(
                    "server refused stream management: {condition}"
                )))
            }
            other => {
                ctx.link().with_session(|session| session.on_enable_failed());
                Err(ConnectionError::StreamError(format!(
                    "unexpected {other:?} in reply to <enable/>"
                )))
            }
        }
    }
}

impl ModuleRuntime for EnableStreamManagement {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        match offered(ctx) {
            Ok(()) => Feasibility::Possible,
            Err(reason) => Feasibility::Impossible(reason),
        }
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.enable(ctx).await.into()
    }

    fn reset_state(&mut self) {}
}
