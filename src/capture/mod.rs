//! Local media capture
//!
//! Sources run a platform capture helper (or, for the microphone, an ALSA
//! device) and hand encoded media to a [`MediaSink`], normally the relay
//! session's multiplexer.

pub mod args;
pub mod camera;
pub mod channel;
pub mod helper_io;
pub mod lister;
pub mod microphone;
pub mod pcm;
pub mod pipeline;
pub mod screen;
pub mod session;
pub mod source;

pub use args::{CaptureTarget, HelperArgs};
pub use camera::CameraSource;
pub use channel::{ChannelDecoder, ChannelPacket, ChannelStats};
pub use lister::{list_sources, SourceList};
pub use microphone::MicrophoneSource;
pub use pipeline::InputGain;
pub use screen::ScreenSource;
pub use session::{CaptureSession, CaptureState, SourceKind};

use bytes::Bytes;

use crate::error::Result;
use crate::video::nal::AccessUnit;
use crate::webrtc::multiplexer::StreamMultiplexer;
use crate::webrtc::stream::StreamKind;

/// Where capture sources deliver encoded media
///
/// Called synchronously from each source's reader thread; implementations
/// must tolerate concurrent calls for different stream kinds.
pub trait MediaSink: Send + Sync {
    fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> Result<usize>;

    fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> Result<()>;

    /// Frame rate the source was configured with
    fn set_frame_rate(&self, _kind: StreamKind, _fps: u32) {}
}

impl MediaSink for StreamMultiplexer {
    fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> Result<usize> {
        StreamMultiplexer::send_access_unit(self, kind, unit)
    }

    fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> Result<()> {
        StreamMultiplexer::send_audio_frame(self, kind, frame)
    }

    fn set_frame_rate(&self, kind: StreamKind, fps: u32) {
        StreamMultiplexer::set_frame_rate(self, kind, fps)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    /// Records everything a source sends
    #[derive(Default)]
    pub struct CollectingMediaSink {
        pub units: Mutex<Vec<(StreamKind, AccessUnit)>>,
        pub audio: Mutex<Vec<(StreamKind, Bytes)>>,
        pub frame_rates: Mutex<Vec<(StreamKind, u32)>>,
        fail: bool,
    }

    impl CollectingMediaSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    impl MediaSink for CollectingMediaSink {
        fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> Result<usize> {
            if self.fail {
                return Err(AppError::WebRtcError("no peer".to_string()));
            }
            self.units.lock().push((kind, unit));
            Ok(1)
        }

        fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> Result<()> {
            if self.fail {
                return Err(AppError::WebRtcError("no peer".to_string()));
            }
            self.audio.lock().push((kind, frame));
            Ok(())
        }

        fn set_frame_rate(&self, kind: StreamKind, fps: u32) {
            self.frame_rates.lock().push((kind, fps));
        }
    }

    /// Write an executable shell script standing in for the capture helper
    pub fn fake_helper(dir: &Path, body: &str) -> PathBuf {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-capture");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            file.write_all(body.as_bytes()).unwrap();
            file.sync_all().unwrap();
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
