//! Dataset access for curation stages.
//!
//! - **item**: identifiers, immutable work items and input-file loading
//! - **attachment**: base64 image attachments for multimodal prompts
//! - **filter**: the correctness filter applied after verification

pub mod attachment;
pub mod filter;
pub mod item;

pub use attachment::Attachment;
pub use filter::{filter_correct, FilterReport};
pub use item::{read_input, read_records, ItemId, WorkItem, ID_FIELD, IMAGE_FIELD};
