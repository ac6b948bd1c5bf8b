//! Packet and frame queues
//!
//! The two queue types that connect the pipeline stages. Each queue has
//! exactly one producer and one consumer thread; cross-queue coordination
//! happens only through the flush epoch carried on every entry.

mod frame_queue;
mod packet_queue;

pub use frame_queue::{Frame, FrameQueue, QueueDepth};
pub use packet_queue::{Packet, PacketEntry, PacketQueue, PacketQueueStats, Serial};
