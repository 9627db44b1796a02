//! Channel type definitions for inter-task communication

use tokio::sync::mpsc;

use crate::detector::DetectorEvent;

/// Default buffer size between the detector workers and the pipeline
pub const DEFAULT_CHANNEL_SIZE: usize = 1000;

/// Create a detector event channel with the default buffer size
pub fn create_event_channel() -> (mpsc::Sender<DetectorEvent>, mpsc::Receiver<DetectorEvent>) {
    mpsc::channel(DEFAULT_CHANNEL_SIZE)
}
