//! Watermark lookup

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::broker::BrokerClient;
use crate::error::FetchError;
use crate::protocol::{PartitionId, PartitionWatermark};
use crate::Result;

pub struct WatermarkResolver {
    client: Arc<dyn BrokerClient>,
}

impl WatermarkResolver {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client }
    }

    /// Resolve low and high watermarks for every partition in `partitions`.
    ///
    /// An answer that misses a partition or reports `low > high` is treated
    /// as an unavailable broker, since no window can be planned from it.
    pub async fn resolve(
        &self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<HashMap<PartitionId, PartitionWatermark>> {
        let marks = self.client.watermarks(topic, partitions).await?;

        for partition in partitions {
            match marks.get(partition) {
                Some(mark) if mark.low <= mark.high => {}
                Some(mark) => {
                    return Err(FetchError::broker_unavailable(format!(
                        "inconsistent watermarks for {}/{}: low {} > high {}",
                        topic, partition, mark.low, mark.high
                    )))
                }
                None => {
                    return Err(FetchError::broker_unavailable(format!(
                        "no watermarks returned for {}/{}",
                        topic, partition
                    )))
                }
            }
        }

        let available: i64 = marks.values().map(PartitionWatermark::record_count).sum();
        debug!(
            topic,
            partitions = partitions.len(),
            available,
            "Resolved watermarks"
        );
        Ok(marks)
    }
}
