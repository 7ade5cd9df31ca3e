//! Publishing

use std::sync::Arc;

use bytes::Bytes;
use tracing::{instrument, trace};

use crate::{
    connection::ConnectionInner,
    framing::{BasicProperties, ContentHeader, Method, ProtocolEvent},
    Error,
};

use super::SessionInner;

/// Publishes messages on a session's channel
#[derive(Debug, Clone)]
pub struct Producer {
    connection: Arc<ConnectionInner>,
    session: Arc<SessionInner>,
    exchange: String,
    routing_key: String,
    mandatory: bool,
    immediate: bool,
}

impl Producer {
    pub(crate) fn new(
        connection: Arc<ConnectionInner>,
        session: Arc<SessionInner>,
        exchange: String,
        routing_key: String,
    ) -> Self {
        Self {
            connection,
            session,
            exchange,
            routing_key,
            mandatory: false,
            immediate: false,
        }
    }

    /// Asks the broker to return messages that cannot be routed
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Asks the broker to return messages no consumer can take at once
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Publishes to the producer's exchange and routing key
    pub async fn publish(
        &self,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.publish_to(&self.exchange, &self.routing_key, properties, body)
            .await
    }

    /// Publishes to an explicit exchange and routing key
    ///
    /// Waits for the broker to lift a `channel.flow` pause, at most for the
    /// connection's sync timeout.
    #[instrument(skip(self, properties, body), fields(channel = self.session.channel))]
    pub async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let body = body.into();
        let properties = &properties;
        let body = &body;
        let connection = &self.connection;
        let session = &self.session;
        crate::failover::protected(connection, || async move {
            session.ensure_open()?;
            wait_for_flow(connection, session).await?;

            let publish = Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: self.mandatory,
                immediate: self.immediate,
            };
            let header = ContentHeader::basic(body.len() as u64, properties.clone());
            let event = ProtocolEvent::new(session.channel, publish).with_content(header, body.clone());
            trace!(exchange, routing_key, size = body.len(), "publish");
            connection.write(event, true)?;
            session.mark_transaction_dirty();
            Ok(())
        })
        .await
    }
}

async fn wait_for_flow(
    connection: &ConnectionInner,
    session: &SessionInner,
) -> Result<(), Error> {
    let mut flow = session.subscribe_flow();
    if *flow.borrow() {
        return Ok(());
    }
    let timeout = connection.settings.sync_timeout;
    let resumed = tokio::time::timeout(timeout, async {
        flow.wait_for(|active| *active).await.map(|_| ())
    })
    .await;
    match resumed {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(Error::SessionClosed(session.channel)),
        Err(_) => Err(Error::timeout(
            timeout,
            format!("channel {} flow to resume", session.channel),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        connection::ConnectionSettings,
        sasl::SaslRegistry,
        session::{AcknowledgeMode, RejectBehaviour, ResolvedOptions},
        transport::TcpConnector,
    };

    fn connection() -> ConnectionInner {
        let settings = ConnectionSettings {
            sync_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        ConnectionInner::new(
            settings,
            Arc::new(SaslRegistry::with_builtin()),
            Arc::new(TcpConnector::default()),
        )
    }

    fn session() -> SessionInner {
        SessionInner::new(
            1,
            ResolvedOptions {
                acknowledge_mode: AcknowledgeMode::Auto,
                prefetch_high: 10,
                prefetch_low: 5,
                reject_behaviour: RejectBehaviour::Normal,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn paused_flow_times_out() {
        let connection = connection();
        let session = session();
        session.set_flow(false);
        match wait_for_flow(&connection, &session).await {
            Err(Error::TimeoutExpired { waiting_for, .. }) => {
                assert!(waiting_for.contains("flow"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_flow_releases_publisher() {
        let connection = connection();
        let session = Arc::new(session());
        session.set_flow(false);

        let s = session.clone();
        let resume = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s.set_flow(true);
        });
        wait_for_flow(&connection, &session).await.unwrap();
        resume.await.unwrap();
    }
}
