use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel as AmqpChannel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    clients::bus::{Acknowledger, Delivery, DeliveryStream, MessageBus, QueueTopology},
    error::BusError,
    models::{
        message::DeadLetterRecord,
        notification::{Channel, NotificationEnvelope},
    },
};

const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

pub struct RabbitMqBus {
    connection: Connection,
    channel: AmqpChannel,
    topology: QueueTopology,
}

impl RabbitMqBus {
    pub async fn connect(rabbitmq_url: &str, topology: QueueTopology) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        declare_topology(&channel, &topology).await?;

        info!(exchange = %topology.exchange, "RabbitMQ topology declared");

        Ok(Self {
            connection,
            channel,
            topology,
        })
    }

    async fn publish_bytes(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let confirm = self
            .channel
            .basic_publish(
                &self.topology.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(BusError::Publish(format!(
                "broker refused message routed to '{}'",
                routing_key
            )));
        }

        Ok(())
    }
}

async fn declare_topology(channel: &AmqpChannel, topology: &QueueTopology) -> Result<(), Error> {
    channel
        .exchange_declare(
            &topology.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| anyhow!("Failed to declare exchange: {}", e))?;

    let mut bindings: Vec<(&str, &str)> = Channel::ALL
        .iter()
        .map(|c| (topology.queue_for(*c), QueueTopology::routing_key(*c)))
        .collect();
    bindings.push((
        topology.dead_letter_queue.as_str(),
        topology.dead_letter_routing_key.as_str(),
    ));

    for (queue, routing_key) in bindings {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue '{}': {}", queue, e))?;

        channel
            .queue_bind(
                queue,
                &topology.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to bind queue '{}': {}", queue, e))?;

        debug!(queue, routing_key, "Queue declared and bound");
    }

    Ok(())
}

fn string_header(value: impl Into<String>) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.into()))
}

fn dead_letter_headers(record: &DeadLetterRecord) -> FieldTable {
    let mut headers = FieldTable::default();

    headers.insert(
        ShortString::from("x-original-queue"),
        string_header(record.original_queue.clone()),
    );
    headers.insert(
        ShortString::from("x-failed-at"),
        string_header(record.failed_at.to_rfc3339()),
    );
    headers.insert(ShortString::from("x-error"), string_header(record.error.clone()));

    if let Some(notification_id) = &record.notification_id {
        headers.insert(
            ShortString::from("x-notification-id"),
            string_header(notification_id.clone()),
        );
    }

    headers
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }

    async fn requeue(&self) -> Result<(), BusError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }

    async fn reject(&self) -> Result<(), BusError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Acknowledge(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for RabbitMqBus {
    async fn publish(&self, envelope: &NotificationEnvelope) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(envelope).map_err(|e| BusError::Publish(e.to_string()))?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(CONTENT_TYPE.into())
            .with_message_id(envelope.notification_id.clone().into())
            .with_correlation_id(envelope.correlation_id.clone().into());

        self.publish_bytes(QueueTopology::routing_key(envelope.channel), &payload, properties)
            .await?;

        debug!(
            notification_id = %envelope.notification_id,
            channel = %envelope.channel,
            "Envelope published"
        );

        Ok(())
    }

    async fn publish_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), BusError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(CONTENT_TYPE.into())
            .with_headers(dead_letter_headers(record));

        self.publish_bytes(
            &self.topology.dead_letter_routing_key,
            &record.payload,
            properties,
        )
        .await
    }

    async fn subscribe(
        &self,
        channel: Channel,
        prefetch: u16,
    ) -> Result<DeliveryStream, BusError> {
        let consumer_channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        consumer_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        let queue = self.topology.queue_for(channel);
        let consumer_tag = format!("{}-worker-{}", channel, Uuid::new_v4());

        let consumer = consumer_channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        info!(queue, prefetch, consumer_tag = %consumer_tag, "Consumer created");

        // The stream owns its AMQP channel so the channel lives as long as the consumer.
        let deliveries = consumer.map(move |delivery| {
            let _channel = &consumer_channel;
            delivery
                .map(|d| {
                    Delivery::new(d.data, d.redelivered, Box::new(LapinAcker { acker: d.acker }))
                })
                .map_err(|e| BusError::Consume(e.to_string()))
        });

        Ok(deliveries.boxed())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn topology(&self) -> &QueueTopology {
        &self.topology
    }
}
