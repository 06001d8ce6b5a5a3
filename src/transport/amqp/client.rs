//! lapin-backed implementation of the broker traits

use super::connection::ConnectionOptions;
use crate::transport::{
    BrokerConnector, BrokerDelivery, BrokerError, BrokerSession, ConnectionObserver,
    DeliveryStream, Disposition,
};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

/// AMQP delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code for a normal connection close
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections with one confirm-enabled channel each
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(
        &self,
        options: &ConnectionOptions,
        observer: ConnectionObserver,
    ) -> Result<AmqpSession, BrokerError> {
        let uri = options.to_uri()?;
        debug!(uri = %options.redacted_uri()?, "Opening AMQP connection");

        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        // lapin reports both heartbeat loss and server-initiated closes here
        let error_observer = observer.clone();
        connection.on_error(move |e| error_observer.on_error(e.to_string()));

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

        info!("Connected to RabbitMQ server at {}", options.hostname);

        Ok(AmqpSession {
            connection,
            channel,
            observer,
        })
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    observer: ConnectionObserver,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    type Delivery = AmqpDelivery;

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ChannelFailed(format!("declare '{queue}': {e}")))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| BrokerError::ChannelFailed(format!("prefetch {count}: {e}")))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<AmqpDelivery>, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ChannelFailed(format!("consume '{queue}': {e}")))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|inner| AmqpDelivery { inner })
                .map_err(|e| BrokerError::ChannelFailed(e.to_string()))
        });

        // End of the consumer stream is reported like a connection close
        let observer = self.observer.clone();
        let end_marker = stream::once(async move {
            observer.on_close("consumer stream ended");
            None
        });

        Ok(deliveries
            .map(Some)
            .chain(end_marker)
            .filter_map(future::ready)
            .boxed())
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);

        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishFailed(format!(
                "broker refused message for '{queue}'"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| BrokerError::CloseFailed(e.to_string()))
    }
}

pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl BrokerDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        let acker = &self.inner.acker;
        let outcome = match disposition {
            Disposition::Ack => acker.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
            }
            Disposition::Reject => acker.reject(BasicRejectOptions { requeue: false }).await,
        };
        outcome.map_err(|e| BrokerError::SettleFailed(format!("{disposition:?}: {e}")))
    }
}
