use std::collections::HashSet;
use std::str::FromStr;

use sasl::client::Mechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tracing::{debug, warn};
use xmpp_parsers::ns;
use xmpp_parsers::sasl::{Auth, Challenge, Failure, Mechanism as SaslMechanism, Response, Success};

use super::ModuleRuntime;
use crate::error::ConnectionError;
use crate::features::StreamFeatures;
use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::transport::TransportConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

pub fn select_mechanism(server_mechanisms: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "failed to initialize SCRAM-SHA-256: {e:?}"
                ))
            }),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "failed to initialize SCRAM-SHA-1: {e:?}"
                ))
            }),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!("failed to initialize PLAIN: {e:?}"))
            }),
    }
}

pub(crate) fn map_failure(failure: &Failure) -> ConnectionError {
    let condition = format!("{:?}", failure.defined_condition);
    let text = failure.texts.values().next().cloned().unwrap_or_default();

    if text.is_empty() {
        ConnectionError::AuthenticationFailed(condition)
    } else {
        ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
    }
}

/// RFC 6120 § 6 authentication. Holds the mechanism in flight for the
/// current attempt.
#[derive(Default)]
pub struct SaslAuthentication {
    selected: Option<SelectedMechanism>,
    mechanism: Option<Box<dyn Mechanism + Send>>,
}

impl std::fmt::Debug for SaslAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslAuthentication")
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl SaslAuthentication {
    pub fn selected(&self) -> Option<SelectedMechanism> {
        self.selected
    }

    async fn authenticate<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> Result<TransitionOutcome, ConnectionError> {
        let server_mechanisms = &ctx.features().mechanisms;
        debug!(mechanisms = ?server_mechanisms, "server advertised SASL mechanisms");

        let selected = select_mechanism(server_mechanisms).ok_or_else(|| {
            ConnectionError::AuthenticationFailed(format!(
                "no supported SASL mechanism found; server offers: {}",
                server_mechanisms
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let credentials = Credentials::default()
            .with_username(ctx.config().username()?)
            .with_password(ctx.config().password.clone())
            .with_channel_binding(ChannelBinding::Unsupported);

        let mut mechanism = build_mechanism(selected, &credentials)?;
        let initial_data = mechanism.initial();
        let mechanism_name = SaslMechanism::from_str(mechanism.name()).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("invalid SASL mechanism name: {e}"))
        })?;
        self.selected = Some(selected);

        ctx.send_element(
            &Auth {
                mechanism: mechanism_name,
                data: initial_data,
            }
            .into(),
        )
        .await?;

        loop {
            let reply = ctx.next_element().await?;
            if reply.ns() != ns::SASL {
                return Err(ConnectionError::StreamError(format!(
                    "unexpected <{}/> during SASL negotiation",
                    reply.name()
                )));
            }

            if let Ok(challenge) = Challenge::try_from(reply.clone()) {
                let response_data = mechanism.response(&challenge.data).map_err(|e| {
                    ConnectionError::AuthenticationFailed(format!(
                        "SASL challenge-response failed: {e:?}"
                    ))
                })?;
                ctx.send_element(&Response { data: response_data }.into())
                    .await?;
            } else if let Ok(success) = Success::try_from(reply.clone()) {
                if let Err(e) = mechanism.success(&success.data) {
                    warn!(error = ?e, "server signature verification failed");
                    return Err(ConnectionError::AuthenticationFailed(format!(
                        "server signature verification failed: {e:?}"
                    )));
                }

                debug!("SASL authentication succeeded");
                self.mechanism = Some(mechanism);
                ctx.restart_stream().await?;
                return Ok(TransitionOutcome::success(format!(
                    "authenticated with {selected}"
                )));
            } else if let Ok(failure) = Failure::try_from(reply) {
                debug!(condition = ?failure.defined_condition, "SASL authentication failed");
                return Err(map_failure(&failure));
            } else {
                return Err(ConnectionError::StreamError(
                    "malformed SASL response".to_string(),
                ));
            }
        }
    }
}

/// A plain stream the server wants encrypted aborts the walk.
fn feasibility(features: &StreamFeatures, secure: bool) -> Feasibility {
    if features.starttls_required && !secure {
        return Feasibility::Fatal(ConnectionError::SecurityRequiredByServer);
    }
    if features.mechanisms.is_empty() {
        return Feasibility::Impossible("server did not advertise any SASL mechanisms".to_string());
    }
    if select_mechanism(&features.mechanisms).is_none() {
        return Feasibility::Impossible("no supported SASL mechanism offered".to_string());
    }
    Feasibility::Possible
}

impl ModuleRuntime for SaslAuthentication {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        feasibility(ctx.features(), ctx.is_secure())
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        self.authenticate(ctx).await.into()
    }

    fn reset_state(&mut self) {
        self.selected = None;
        self.mechanism = None;
    }
}
