//! # Audio Module
//!
//! Per-chat playback state.
//!
//! ### [`queue`] - Queue Management
//! - Strict FIFO of [`queue::QueueEntry`], bounded by `MAX_QUEUE_SIZE`
//!
//! ### [`session`] - Call Session
//! - `Idle → Connecting → Playing ⇄ Paused` state machine for one chat's voice call
//!
//! ### [`player`] - Session Manager
//! - Owns one queue and one session per chat
//! - Fetches sources and hands them to the call transport
//! - Advances on end of track, leaves the call when the queue runs dry
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let manager = SessionManager::new(fetcher, transport, config.max_queue_size);
//!
//! let entry = QueueEntry::new(metadata, user_id, false);
//! match manager.play(chat_id, entry).await? {
//!     PlayOutcome::Started => info!("▶️ Reproduciendo"),
//!     PlayOutcome::Queued(position) => info!("📝 En cola: #{}", position),
//! }
//!
//! manager.pause(chat_id).await?;
//! manager.resume(chat_id).await?;
//! manager.skip(chat_id).await?;
//! manager.stop(chat_id).await?;
//! ```

pub mod player;
pub mod queue;
pub mod session;
