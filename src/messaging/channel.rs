use lapin::{options::BasicQosOptions, Channel, Connection};
use tracing::{error, info};

pub struct ChannelProvider;

impl ChannelProvider {
    /// Opens a channel limited to `prefetch_count` unsettled deliveries.
    ///
    /// Messages waiting on a deferred release stay unsettled and count against the
    /// prefetch window until they are abandoned.
    pub async fn create_channel(
        connection: &Connection,
        prefetch_count: u16,
    ) -> Result<Channel, ChannelError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, prefetch_count, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        info!(
            channel_id = channel.id(),
            prefetch_count,
            "Channel created and QoS configured"
        );

        Ok(channel)
    }

    pub async fn close_channel(channel: Channel) -> Result<(), ChannelError> {
        let channel_id = channel.id();
        if !channel.status().connected() {
            return Ok(());
        }

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}
