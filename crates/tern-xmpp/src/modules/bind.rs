use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::bind::{BindQuery, BindResponse};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::jid::Jid;
use xmpp_parsers::minidom::Element;

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::legacy_ns;
use crate::transport::TransportConnector;

/// RFC 6120 § 7 resource binding, followed by the RFC 3921 session
/// request when the server still insists on one.
#[derive(Debug, Default)]
pub struct ResourceBinding {
    request_id: Option<String>,
}

impl ResourceBinding {
    /// Id of the outstanding bind request, if one is in flight.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    fn bind_request(id: &str, resource: Option<&str>) -> Element {
        Iq::from_set(id, BindQuery::new(resource.map(str::to_string))).into()
    }

    fn session_request(id: &str) -> Element {
        Iq::Set {
            from: None,
            to: None,
            id: id.to_string(),
            payload: Element::builder("session", legacy_ns::SESSION).build(),
        }
        .into()
    }

    fn bound_jid(payload: Option<Element>) -> Result<String, ConnectionError> {
        let payload = payload.ok_or_else(|| {
            ConnectionError::StreamError("resource binding result carries no JID".to_string())
        })?;
        let bind = BindResponse::try_from(payload).map_err(|error| {
            ConnectionError::StreamError(format!("invalid resource bind response payload: {error}"))
        })?;
        Ok(Jid::from(bind).to_string())
    }

    /// Wait for the reply to the iq with `id`.
    async fn await_result<C: TransportConnector>(
        ctx: &mut ConnectionContext<C>,
        id: &str,
    ) -> Result<Iq, ConnectionError> {
        loop {
            let element = ctx.next_element().await?;
            let name = element.name().to_string();
            match Iq::try_from(element) {
                Ok(iq) if iq.id() == id => return Ok(iq),
                _ => debug!(element = %name, "ignoring unrelated element while binding"),
            }
        }
    }

    async fn bind<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        let id = Uuid::new_v4().to_string();
        let resource = ctx.config().resource.clone();
        self.request_id = Some(id.clone());
        ctx.send_element(&Self::bind_request(&id, resource.as_deref()))
            .await?;

        let reply = Self::await_result(ctx, &id).await?;
        self.request_id = None;
        let jid = match reply {
            Iq::Result { payload, .. } => Self::bound_jid(payload)?,
            Iq::Error { error, .. } => {
                return Ok(TransitionOutcome::failed(format!(
                    "server refused resource binding: {:?}",
                    error.defined_condition
                )));
            }
            Iq::Get { .. } | Iq::Set { .. } => {
                return Err(ConnectionError::StreamError(
                    "invalid response to resource binding".to_string(),
                ));
            }
        };
        debug!(%jid, "resource bound");
        ctx.set_bound_jid(jid.clone());

        if ctx.features().requires_session() {
            let session_id = Uuid::new_v4().to_string();
            ctx.send_element(&Self::session_request(&session_id)).await?;
            if !matches!(Self::await_result(ctx, &session_id).await?, Iq::Result { .. }) {
                return Ok(TransitionOutcome::failed("server refused legacy session"));
            }
            debug!("legacy session established");
        }

        Ok(TransitionOutcome::success(format!("bound {jid}")))
    }
}

impl ModuleRuntime for ResourceBinding {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        if ctx.features().bind {
            Feasibility::Possible
        } else {
            Feasibility::Impossible("server does not offer resource binding".to_string())
        }
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.bind(ctx).await.into()
    }

    fn reset_state(&mut self) {
        self.request_id = None;
    }
}
