pub mod config;
pub mod error;
pub mod ipc;
pub mod sandbox;
pub mod store;

pub use config::{NanoclawConfig, load_config};
pub use error::{Error, Result};
pub use ipc::{
    CLOSE_SENTINEL, FolderContext, InputFrame, IpcPaths, OutboundFrame, TaskCommand,
    frame_file_name, is_frame_file_name, is_valid_folder, write_close_sentinel, write_frame,
};
pub use sandbox::{
    OUTPUT_END_MARKER, OUTPUT_START_MARKER, SandboxInput, SandboxOutput, SandboxStatus,
    VolumeMount, extract_framed_records, strip_internal_spans,
};
pub use store::{
    ChatMetadata, ContextMode, Message, RegisteredGroup, ScheduleKind, ScheduledTask, Store,
    TaskRunLog, TaskStatus, now_rfc3339,
};
