//! Command-line AHX player.
//!
//! Plays a module through the default audio device, or renders it to a
//! WAV file with `--wav`. The replayer runs on the main thread and feeds
//! a queue the audio callback drains, so all control-side state stays on
//! one side of a single lock.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ahx_replayer::Player;
use ahx_replayer::ahx_waves::WaveBank;
use ahx_replayer::format_ahx::Song;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

const AUDIO_CHANNELS: usize = 2;
const AUDIO_QUEUE_SECONDS: usize = 2;
const RENDER_CHUNK_FRAMES: usize = 2048;

struct Config {
    module: PathBuf,
    wav: Option<PathBuf>,
    loops: Option<u32>,
    subsong: u8,
    rate: i32,
    volume: i32,
    stereo: i32,
    max_seconds: u64,
}

fn main() -> ExitCode {
    let config = match parse_args() {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!("Usage: ahx-runner [OPTIONS] <module.ahx>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --wav <file>       Render to a WAV file instead of playing");
    eprintln!("  --loops <n>        Song loops before stopping [WAV default: 1]");
    eprintln!("  --subsong <n>      Subsong to play, 0 = main song [default: 0]");
    eprintln!("  --rate <hz>        Output sample rate [default: 48000]");
    eprintln!("  --volume <0-256>   Master volume [default: 256]");
    eprintln!("  --stereo <0-100>   Stereo separation percentage [default: 20]");
    eprintln!("  --max-seconds <n>  Hard cap for WAV rendering [default: 600]");
    eprintln!("  --help             Show this help");
}

fn parse_args() -> Result<Option<Config>, String> {
    let mut module = None;
    let mut wav = None;
    let mut loops = None;
    let mut subsong = 0u8;
    let mut rate = 48_000i32;
    let mut volume = 256i32;
    let mut stereo = 20i32;
    let mut max_seconds = 600u64;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            "--wav" => wav = Some(PathBuf::from(next_value(&mut args, "--wav")?)),
            "--loops" => loops = Some(parse_value(&mut args, "--loops")?),
            "--subsong" => subsong = parse_value(&mut args, "--subsong")?,
            "--rate" => rate = parse_value(&mut args, "--rate")?,
            "--volume" => volume = parse_value(&mut args, "--volume")?,
            "--stereo" => stereo = parse_value(&mut args, "--stereo")?,
            "--max-seconds" => max_seconds = parse_value(&mut args, "--max-seconds")?,
            other if other.starts_with("--") => {
                return Err(format!("unknown option {other}"));
            }
            other => {
                if module.replace(PathBuf::from(other)).is_some() {
                    return Err(String::from("more than one module file given"));
                }
            }
        }
    }

    let Some(module) = module else {
        return Err(String::from("no module file given"));
    };

    Ok(Some(Config {
        module,
        wav,
        loops,
        subsong,
        rate,
        volume,
        stereo,
        max_seconds,
    }))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} needs a value"))
}

fn parse_value<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T, String> {
    next_value(args, flag)?
        .parse()
        .map_err(|_| format!("{flag} needs a numeric value"))
}

fn run(config: &Config) -> Result<(), String> {
    let data = std::fs::read(&config.module)
        .map_err(|e| format!("failed to read {}: {e}", config.module.display()))?;
    let song = Song::from_bytes(&data)
        .map_err(|e| format!("failed to load {}: {e}", config.module.display()))?;

    let waves = WaveBank::build();
    let mut player = Player::new(&song, &waves, config.rate);
    player.set_master_volume(config.volume);
    player.set_stereo_separation(config.stereo);
    player.play(config.subsong);

    let name = if song.name().is_empty() {
        "(untitled)"
    } else {
        song.name()
    };
    eprintln!(
        "{name}: {:.1} BPM, {} position(s), {} subsong(s), {} Hz",
        player.bpm(),
        song.len,
        song.num_subsongs,
        player.output_rate()
    );

    match &config.wav {
        Some(path) => {
            player.set_loop_times(config.loops.unwrap_or(1).saturating_sub(1));
            render_wav(&mut player, path, config.max_seconds)
        }
        None => {
            player.set_loop_times(config.loops.map_or(u32::MAX, |n| n.saturating_sub(1)));
            play_live(&mut player)
        }
    }
}

fn render_wav(player: &mut Player<'_>, path: &Path, max_seconds: u64) -> Result<(), String> {
    let rate = player.output_rate() as u32;
    let spec = hound::WavSpec {
        channels: AUDIO_CHANNELS as u16,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| format!("failed to create WAV {}: {e}", path.display()))?;

    let max_frames = max_seconds * u64::from(rate);
    let mut frames_written = 0u64;
    let mut chunk = vec![0i16; RENDER_CHUNK_FRAMES * AUDIO_CHANNELS];

    while !player.finished() {
        player.render(&mut chunk);
        for &sample in &chunk {
            writer
                .write_sample(sample)
                .map_err(|e| format!("failed to write WAV sample: {e}"))?;
        }

        frames_written += RENDER_CHUNK_FRAMES as u64;
        if frames_written >= max_frames {
            eprintln!("Reached --max-seconds cap, stopping.");
            break;
        }
    }

    writer
        .finalize()
        .map_err(|e| format!("failed to finalize WAV {}: {e}", path.display()))?;

    eprintln!(
        "Wrote {:.1}s to {}",
        frames_written as f64 / f64::from(rate),
        path.display()
    );
    Ok(())
}

fn play_live(player: &mut Player<'_>) -> Result<(), String> {
    let output = AudioOutput::new(player.output_rate() as u32)?;

    let low_water = output.max_samples / 2;
    let mut chunk = vec![0i16; RENDER_CHUNK_FRAMES * AUDIO_CHANNELS];

    while !player.finished() {
        if output.queued_samples() < low_water {
            player.render(&mut chunk);
            output.push_samples(&chunk);
        } else {
            thread::sleep(Duration::from_millis(2));
        }
    }

    // Let the queue drain before tearing the stream down.
    while output.queued_samples() > 0 {
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

struct AudioOutput {
    _stream: cpal::Stream,
    queue: Arc<Mutex<VecDeque<i16>>>,
    max_samples: usize,
}

impl AudioOutput {
    fn new(sample_rate: u32) -> Result<Self, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| String::from("no default audio output device"))?;

        let supported_configs = device
            .supported_output_configs()
            .map_err(|e| format!("failed to query output configs: {e}"))?;

        let desired = supported_configs
            .filter(|cfg| cfg.channels() == AUDIO_CHANNELS as u16)
            .find(|cfg| {
                let min = cfg.min_sample_rate().0;
                let max = cfg.max_sample_rate().0;
                min <= sample_rate && sample_rate <= max
            })
            .ok_or_else(|| {
                format!("no {AUDIO_CHANNELS}-channel output config supports {sample_rate} Hz")
            })?;

        let sample_format = desired.sample_format();
        let config = desired.with_sample_rate(cpal::SampleRate(sample_rate)).config();

        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let max_samples = sample_rate as usize * AUDIO_CHANNELS * AUDIO_QUEUE_SECONDS;

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                let callback_queue = Arc::clone(&queue);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _| write_audio_data_f32(data, &callback_queue),
                        |err| eprintln!("Audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| format!("failed to build f32 audio stream: {e}"))?
            }
            cpal::SampleFormat::I16 => {
                let callback_queue = Arc::clone(&queue);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [i16], _| write_audio_data_i16(data, &callback_queue),
                        |err| eprintln!("Audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| format!("failed to build i16 audio stream: {e}"))?
            }
            cpal::SampleFormat::U16 => {
                let callback_queue = Arc::clone(&queue);
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [u16], _| write_audio_data_u16(data, &callback_queue),
                        |err| eprintln!("Audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| format!("failed to build u16 audio stream: {e}"))?
            }
            other => {
                return Err(format!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .map_err(|e| format!("failed to start audio stream: {e}"))?;

        Ok(Self {
            _stream: stream,
            queue,
            max_samples,
        })
    }

    fn queued_samples(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn push_samples(&self, samples: &[i16]) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };

        for &sample in samples {
            queue.push_back(sample);
        }

        while queue.len() > self.max_samples {
            let _ = queue.pop_front();
        }
    }
}

fn write_audio_data_f32(data: &mut [f32], queue: &Arc<Mutex<VecDeque<i16>>>) {
    let Ok(mut guard) = queue.lock() else {
        data.fill(0.0);
        return;
    };

    for sample in data {
        *sample = f32::from(guard.pop_front().unwrap_or(0)) / 32768.0;
    }
}

fn write_audio_data_i16(data: &mut [i16], queue: &Arc<Mutex<VecDeque<i16>>>) {
    let Ok(mut guard) = queue.lock() else {
        data.fill(0);
        return;
    };

    for sample in data {
        *sample = guard.pop_front().unwrap_or(0);
    }
}

fn write_audio_data_u16(data: &mut [u16], queue: &Arc<Mutex<VecDeque<i16>>>) {
    let Ok(mut guard) = queue.lock() else {
        data.fill(0x8000);
        return;
    };

    for sample in data {
        *sample = (i32::from(guard.pop_front().unwrap_or(0)) + 0x8000) as u16;
    }
}
