//! Ingestion job broker: at-least-once delivery of
//! `process_document(doc_id)` jobs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// A document-processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJob {
    pub document_id: i64,
}

/// Dispatch side of the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn dispatch(&self, job: &IngestJob) -> Result<()>;
}

fn berr(err: lapin::Error) -> Error {
    Error::TransientExternal(format!("broker: {err}"))
}

/// AMQP broker. Jobs are acknowledged after the handler returns, so a
/// crashed worker leaves its job unacked and the broker redelivers it.
pub struct AmqpBroker {
    channel: Channel,
    queue: String,
}

impl AmqpBroker {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(berr)?;
        let channel = connection.create_channel().await.map_err(berr)?;

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
            .map_err(berr)?;
        // One task at a time per worker.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(berr)?;

        info!(queue, "connected to broker");
        Ok(Self {
            channel,
            queue: queue.to_string(),
        })
    }

    /// Consume jobs until the connection drops. The handler's result is
    /// recorded by the worker itself; the delivery is acknowledged
    /// either way so poison jobs cannot loop forever.
    pub async fn consume<F, Fut>(&self, consumer_tag: &str, handler: F) -> Result<()>
    where
        F: Fn(IngestJob) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(berr)?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(berr)?;

            match serde_json::from_slice::<IngestJob>(&delivery.data) {
                Ok(job) => {
                    let document_id = job.document_id;
                    if let Err(err) = handler(job).await {
                        error!(document_id, error = %err, "ingestion job failed");
                    }
                }
                Err(err) => warn!(error = %err, "discarding malformed job payload"),
            }

            delivery.ack(BasicAckOptions::default()).await.map_err(berr)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn dispatch(&self, job: &IngestJob) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                // Persistent delivery: jobs survive a broker restart.
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(berr)?
            .await
            .map_err(berr)?;
        Ok(())
    }
}

/// In-memory queue for tests and one-shot CLI ingestion.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<VecDeque<IngestJob>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<IngestJob> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dispatch(&self, job: &IngestJob) -> Result<()> {
        self.queue.lock().unwrap().push_back(job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_broker_is_fifo() {
        let broker = MemoryBroker::new();
        broker.dispatch(&IngestJob { document_id: 1 }).await.unwrap();
        broker.dispatch(&IngestJob { document_id: 2 }).await.unwrap();

        assert_eq!(broker.pop().unwrap().document_id, 1);
        assert_eq!(broker.pop().unwrap().document_id, 2);
        assert!(broker.pop().is_none());
    }

    #[test]
    fn job_payload_round_trips() {
        let job = IngestJob { document_id: 42 };
        let bytes = serde_json::to_vec(&job).unwrap();
        assert_eq!(serde_json::from_slice::<IngestJob>(&bytes).unwrap(), job);
    }
}
