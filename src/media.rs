//! Local media: one capture device feeding one shared local track that every
//! peer link carries. Muting flips a flag consulted in the capture callback;
//! no renegotiation, and every link sees the change at once.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

/// The current local track set, attached to each link as it is created and
/// re-queried on renegotiation. Errors when no capture device is available.
pub trait LocalMediaSource: Send + Sync {
    fn tracks(&self) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>>;
}

/// A fixed track set, used to hand an already-acquired capture track to the
/// link factory (the capture handle itself cannot cross threads).
pub struct StaticTrackSource {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl StaticTrackSource {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }
}

impl LocalMediaSource for StaticTrackSource {
    fn tracks(&self) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>> {
        if self.tracks.is_empty() {
            return Err(Error::Media("no local tracks available".into()));
        }
        Ok(self.tracks.clone())
    }
}

/// Microphone capture. Owns the cpal input stream (not `Send`; stays on the
/// main task) and the shared local track that is fanned out to every link.
pub struct AudioCapture {
    _input_stream: cpal::Stream,
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
}

impl AudioCapture {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Media("no input device available".into()))?;
        let config = device
            .default_input_config()
            .map_err(|e| Error::Media(format!("input config: {}", e)))?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "convomesh".to_owned(),
        ));
        let muted = Arc::new(AtomicBool::new(false));

        let input_stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(
                &device,
                &config.into(),
                track.clone(),
                muted.clone(),
            )?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(
                &device,
                &config.into(),
                track.clone(),
                muted.clone(),
            )?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(
                &device,
                &config.into(),
                track.clone(),
                muted.clone(),
            )?,
            format => return Err(Error::Media(format!("unsupported sample format {:?}", format))),
        };

        input_stream
            .play()
            .map_err(|e| Error::Media(format!("starting capture: {}", e)))?;

        Ok(Self {
            _input_stream: input_stream,
            track,
            muted,
        })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Single local mutation; every link stops hearing us at once.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        track: Arc<TrackLocalStaticSample>,
        muted: Arc<AtomicBool>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        let err_fn = |err| warn!(error = %err, "input audio stream error");

        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let mut payload = Vec::with_capacity(data.len() * 4);
                    if muted.load(Ordering::Relaxed) {
                        payload.resize(data.len() * 4, 0);
                    } else {
                        for sample in data {
                            let value: f32 = f32::from_sample(*sample);
                            payload.extend_from_slice(&value.to_le_bytes());
                        }
                    }
                    let frames = data.len() / channels.max(1);
                    let sample = Sample {
                        data: Bytes::from(payload),
                        duration: Duration::from_secs_f64(
                            frames as f64 / sample_rate.max(1) as f64,
                        ),
                        ..Default::default()
                    };
                    if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                        warn!(error = %e, "failed to write audio sample");
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::Media(format!("building input stream: {}", e)))?;

        Ok(stream)
    }
}

/// Speaker playback for one remote audio track.
pub struct AudioPlayback {
    _output_stream: cpal::Stream,
}

impl AudioPlayback {
    pub fn new(track: Arc<TrackRemote>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Media("no output device available".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| Error::Media(format!("output config: {}", e)))?;

        let (sample_tx, sample_rx) = std::sync::mpsc::channel::<Vec<f32>>();

        tokio::spawn(async move {
            while let Ok((rtp, _)) = track.read_rtp().await {
                let samples: Vec<f32> = rtp
                    .payload
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                if sample_tx.send(samples).is_err() {
                    break;
                }
            }
        });

        let output_stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_output_stream::<f32>(&device, &config.into(), sample_rx)?,
            SampleFormat::I16 => Self::build_output_stream::<i16>(&device, &config.into(), sample_rx)?,
            SampleFormat::U16 => Self::build_output_stream::<u16>(&device, &config.into(), sample_rx)?,
            format => return Err(Error::Media(format!("unsupported sample format {:?}", format))),
        };

        output_stream
            .play()
            .map_err(|e| Error::Media(format!("starting playback: {}", e)))?;

        Ok(Self {
            _output_stream: output_stream,
        })
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        sample_rx: std::sync::mpsc::Receiver<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let err_fn = |err| warn!(error = %err, "output audio stream error");
        let mut leftover: Vec<f32> = Vec::new();

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    while leftover.len() < data.len() {
                        match sample_rx.try_recv() {
                            Ok(mut samples) => leftover.append(&mut samples),
                            Err(_) => break,
                        }
                    }
                    for (i, out) in data.iter_mut().enumerate() {
                        let value = leftover.get(i).copied().unwrap_or(0.0);
                        *out = T::from_sample(value);
                    }
                    let consumed = data.len().min(leftover.len());
                    leftover.drain(..consumed);
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::Media(format!("building output stream: {}", e)))?;

        Ok(stream)
    }
}
