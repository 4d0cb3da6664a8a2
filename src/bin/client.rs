use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use convomesh::client::{self, ClientConfig};
use convomesh::link::MediaKind;
use convomesh::media::{AudioCapture, AudioPlayback, StaticTrackSource};
use convomesh::mesh::MeshEvent;
use convomesh::rtc::{RtcFactory, RtpSource};
use webrtc::track::track_local::TrackLocal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = ClientConfig {
        url: std::env::var("CONVOMESH_URL").unwrap_or_else(|_| "ws://127.0.0.1:5000".to_owned()),
        token: std::env::var("CONVOMESH_TOKEN")
            .map_err(|_| anyhow::anyhow!("CONVOMESH_TOKEN must be set"))?,
        room: std::env::var("CONVOMESH_ROOM")
            .map_err(|_| anyhow::anyhow!("CONVOMESH_ROOM must be set"))?,
        email: std::env::var("CONVOMESH_EMAIL")
            .map_err(|_| anyhow::anyhow!("CONVOMESH_EMAIL must be set"))?,
    };

    // One capture device; its track is fanned out to every peer link. The
    // capture handle itself stays on this task.
    let capture = AudioCapture::new()?;
    let source = StaticTrackSource::new(vec![capture.track() as Arc<dyn TrackLocal + Send + Sync>]);
    let factory = Arc::new(RtcFactory::new(Arc::new(source))?);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<MeshEvent>();
    // cpal streams (inside AudioPlayback) are not Send, so this loop runs on
    // its own thread instead of the multithreaded tokio pool.
    let runtime = tokio::runtime::Handle::current();
    std::thread::spawn(move || runtime.block_on(async move {
        let mut playbacks = Vec::new();
        while let Some(event) = events_rx.recv().await {
            match event {
                MeshEvent::RemoteMedia { peer, source } => {
                    info!(%peer, "remote media arrived");
                    if source.kind() == MediaKind::Audio {
                        if let Some(rtp) = source.as_any().downcast_ref::<RtpSource>() {
                            match AudioPlayback::new(rtp.track().clone()) {
                                Ok(playback) => playbacks.push(playback),
                                Err(e) => warn!(%peer, error = %e, "playback failed"),
                            }
                        }
                    }
                }
                MeshEvent::LinkStable { peer } => info!(%peer, "link stable"),
                MeshEvent::PeerGone { peer } => info!(%peer, "peer left"),
                MeshEvent::CallFailed { peer, reason } => {
                    warn!(%peer, %reason, "call setup failed");
                }
            }
        }
    }));

    // "m" + enter flips the microphone for every link at once; the capture
    // handle stays on this task, so the toggle is handled here.
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let session = client::run(config, factory, events_tx);
    tokio::pin!(session);
    loop {
        tokio::select! {
            result = &mut session => {
                result?;
                break;
            }
            line = lines.next_line() => {
                if let Ok(Some(line)) = line {
                    if is_mute_command(&line) {
                        capture.set_muted(!capture.is_muted());
                        info!(muted = capture.is_muted(), "microphone toggled");
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_mute_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("m")
}

#[cfg(test)]
mod tests {
    use super::is_mute_command;

    #[test]
    fn mute_command_tolerates_whitespace_and_case() {
        assert!(is_mute_command("m"));
        assert!(is_mute_command(" M \n"));
        assert!(!is_mute_command("mm"));
        assert!(!is_mute_command(""));
    }
}
