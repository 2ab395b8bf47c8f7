//! AHX 2.3d-sp3 replayer.
//!
//! The tracker's "SID interrupt" runs once per CIA timer tick and does
//! three things, strictly in this order:
//!
//! 1. **Register commit** — pending period/waveform/volume changes from the
//!    previous tick are written to the virtual Paula.
//! 2. **Step** — when the per-step tick countdown hits zero, one row of
//!    each voice's track is decoded: notes, instrument triggers and the
//!    pattern effect commands.
//! 3. **Frame** — every tick: hard/note cut, note delay, ADSR, volume
//!    slides, portamento, vibrato, the instrument's perf-list
//!    micro-program, square/filter modulation, waveform selection, and the
//!    final period/volume computation.
//!
//! [`Player::render`] drives the mixer in sub-tick chunks: whenever the
//! 32.32 fixed-point tick counter runs out it executes one tick, then
//! mixes up to the next tick boundary.
//!
//! AHX songs lean on the original's integer quirks, which are kept intact:
//! perf speed 0x80 underflowing the signed wait byte, the XOR overshoot
//! test in limited portamento, negative final notes reading 68020 code
//! bytes in front of the period table, and byte-wrapping modulation
//! counters. See the individual comments.

mod tables;
mod voice;

pub use ahx_waves;
pub use format_ahx;
pub use paula_virtual;

use ahx_waves::{FILTER_SECTION_LEN, NOISE_LEN, WAVE_OFFSETS, WaveBank};
use format_ahx::{Instrument, PERF_LIST_ROWS, Song};
use paula_virtual::{AMIGA_VOICES, PaulaMixer, SAMPLE_RAM_BYTES};

use tables::{BEFORE_PERIOD_TABLE, CIA_PERIOD_TABLE, PERIOD_TABLE, VIB_TABLE};
use voice::{AudioSource, VoiceTemp};

/// Mixing scratch size per render chunk, in samples.
const TEMP_BUF_SAMPLES: usize = 512;

/// Mask for picking a playback window inside the noise bank.
const NOISE_WINDOW_MASK: u32 = (NOISE_LEN - SAMPLE_RAM_BYTES - 1) as u32;

/// Stand-in for non-loaded instrument numbers. Real songs trigger
/// instruments that were never stored; the tracker hands them this record.
const EMPTY_INSTRUMENT: Instrument = Instrument {
    volume: 0,
    filter_speed_wavelength: 4 << 3,
    a_frames: 1,
    a_volume: 0,
    d_frames: 1,
    d_volume: 0,
    s_frames: 1,
    r_frames: 1,
    r_volume: 0,
    filter_lower_limit: 1,
    vibrato_delay: 0,
    vibrato_depth: 0,
    vibrato_speed: 0,
    square_lower_limit: 0x20,
    square_upper_limit: 0x3F,
    square_speed: 1,
    filter_upper_limit: 0x1F,
    perf_speed: 1,
    perf_length: 0,
    perf_list: [[0; 4]; PERF_LIST_ROWS],
};

/// One AHX playback instance: borrows the song and the waveform bank,
/// owns the virtual Paula and all per-voice state.
pub struct Player<'a> {
    song: &'a Song,
    waves: &'a WaveBank,
    mixer: PaulaMixer,
    voices: [VoiceTemp; AMIGA_VOICES],

    subsong: u8,
    pos_nr: i32,
    note_nr: i32,
    pos_jump: i32,
    pos_jump_note: i32,
    pattern_break: bool,
    step_wait_frames: i32,
    tempo: i32,
    get_new_position: bool,
    int_playing: bool,

    wn_random: u32,
    loop_counter: u32,
    loop_times: u32,
    finished: bool,
    bpm: f64,
}

impl<'a> Player<'a> {
    /// Create a player for `song` at the given output rate in Hz (clamped
    /// by the mixer, see [`PaulaMixer::new`]).
    #[must_use]
    pub fn new(song: &'a Song, waves: &'a WaveBank, output_rate: i32) -> Self {
        Self {
            song,
            waves,
            mixer: PaulaMixer::new(output_rate),
            voices: [(); AMIGA_VOICES].map(|()| VoiceTemp::new()),
            subsong: 0,
            pos_nr: 0,
            note_nr: 0,
            pos_jump: 0,
            pos_jump_note: 0,
            pattern_break: false,
            step_wait_frames: 0,
            tempo: 6,
            get_new_position: false,
            int_playing: false,
            wn_random: 0,
            loop_counter: 0,
            loop_times: 0,
            finished: false,
            bpm: 0.0,
        }
    }

    /// Start playback. Subsong 0 is the main song; 1..=n select the
    /// subsong start positions, clamping to the last one.
    ///
    /// Resets the loop budget; call [`Player::set_loop_times`] afterwards
    /// for bounded renders.
    pub fn play(&mut self, subsong: u8) {
        self.subsong = 0;
        self.pos_nr = 0;
        if subsong > 0 && self.song.num_subsongs > 0 {
            let mut index = subsong - 1;
            if index >= self.song.num_subsongs {
                index = self.song.num_subsongs - 1;
            }
            self.subsong = index + 1;
            self.pos_nr = i32::from(self.song.subsong_start(usize::from(index)));
            if self.pos_nr >= i32::from(self.song.len) {
                self.pos_nr = 0;
            }
        }

        self.step_wait_frames = 0;
        self.get_new_position = true;
        self.note_nr = 0;
        self.pattern_break = false;
        self.pos_jump = 0;
        self.pos_jump_note = 0;

        for chn in 0..AMIGA_VOICES {
            self.mixer.set_volume(chn, 0);
        }
        for v in &mut self.voices {
            v.reset();
        }
        self.setup_audio_channels();

        let cia_period = CIA_PERIOD_TABLE[usize::from(self.song.cia_period_index)];
        self.mixer.set_cia_period(cia_period);

        self.tempo = 6;
        self.int_playing = true;
        self.finished = false;
        self.loop_counter = 0;
        self.loop_times = 0;

        // First render call runs a tick immediately.
        self.mixer.zero_tick_counter();
        self.mixer.reset_cached_periods();

        self.bpm = PaulaMixer::cia_period_to_hz(cia_period) * 2.5;
        self.wn_random = 0;
    }

    /// Stop playback and fully re-initialize the voice state.
    pub fn stop(&mut self) {
        self.int_playing = false;
        for chn in 0..AMIGA_VOICES {
            self.mixer.set_volume(chn, 0);
        }
        for v in &mut self.voices {
            v.reset();
        }
    }

    /// Jump to the next position at the next rendered sample.
    pub fn next_pattern(&mut self) {
        if self.pos_nr + 1 < i32::from(self.song.len) {
            self.pos_jump = self.pos_nr + 1;
            self.pattern_break = true;
            self.mixer.zero_tick_counter();
        }
    }

    /// Jump to the previous position at the next rendered sample.
    pub fn prev_pattern(&mut self) {
        if self.pos_nr > 0 {
            self.pos_jump = self.pos_nr - 1;
            self.pattern_break = true;
            self.mixer.zero_tick_counter();
        }
    }

    pub fn set_master_volume(&mut self, volume: i32) {
        self.mixer.set_master_volume(volume);
    }

    pub fn set_stereo_separation(&mut self, percentage: i32) {
        self.mixer.set_stereo_separation(percentage);
    }

    pub fn set_pause(&mut self, pause: bool) {
        self.mixer.set_pause(pause);
    }

    pub fn toggle_pause(&mut self) {
        self.mixer.toggle_pause();
    }

    #[must_use]
    pub fn paused(&self) -> bool {
        self.mixer.paused()
    }

    /// How many times the song may wrap through its restart position
    /// before [`Player::finished`] reports true.
    pub fn set_loop_times(&mut self, loops: u32) {
        self.loop_times = loops;
    }

    /// True once the song hit its loop budget or a set-tempo-0 command.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn loop_counter(&self) -> u32 {
        self.loop_counter
    }

    #[must_use]
    pub fn playing(&self) -> bool {
        self.int_playing
    }

    /// Current song position.
    #[must_use]
    pub fn position(&self) -> u16 {
        self.pos_nr as u16
    }

    #[must_use]
    pub fn subsong(&self) -> u8 {
        self.subsong
    }

    /// Tempo of the current CIA period, in beats per minute.
    #[must_use]
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Actual output rate after the mixer's clamping.
    #[must_use]
    pub fn output_rate(&self) -> i32 {
        self.mixer.output_rate()
    }

    /// Produce interleaved stereo int16 frames.
    ///
    /// While paused this writes silence and leaves the tick counter alone,
    /// so unpausing resumes phase-coherently. Rendering N then M frames
    /// is byte-identical to rendering N+M frames in one call.
    pub fn render(&mut self, stream: &mut [i16]) {
        debug_assert_eq!(stream.len() % 2, 0, "stream holds interleaved stereo frames");

        if self.mixer.paused() {
            stream.fill(0);
            return;
        }

        let mut out = 0;
        let mut samples_left = (stream.len() / 2) as i32;
        while samples_left > 0 {
            if self.mixer.tick_sample_counter() <= 0 {
                self.tick();
                self.mixer.refill_tick_counter();
            }

            let until_tick = self.mixer.samples_until_tick();
            let n = samples_left.min(until_tick).min(TEMP_BUF_SAMPLES as i32) as usize;

            let mut mix_l = [0i32; TEMP_BUF_SAMPLES];
            let mut mix_r = [0i32; TEMP_BUF_SAMPLES];
            self.mixer.mix(&mut mix_l[..n], &mut mix_r[..n]);

            for i in 0..n {
                stream[out] = mix_l[i] as i16;
                stream[out + 1] = mix_r[i] as i16;
                out += 2;
            }

            samples_left -= n as i32;
            self.mixer.consume_samples(n as i32);
        }
    }

    /// One replayer tick (the "SID interrupt").
    fn tick(&mut self) {
        if !self.int_playing {
            return;
        }

        // Commit first: last tick's targets reach Paula before this tick's
        // processing can overwrite them.
        for chn in 0..AMIGA_VOICES {
            self.commit_voice(chn);
        }

        if self.step_wait_frames == 0 {
            if self.get_new_position {
                let song = self.song;
                let mut pos_next = self.pos_nr + 1;
                if pos_next == i32::from(song.len) {
                    pos_next = 0;
                }

                for (chn, v) in self.voices.iter_mut().enumerate() {
                    let (track, transpose) = song.position(self.pos_nr as u16, chn);
                    v.track = track;
                    v.transpose = transpose;
                    let (next_track, _) = song.position(pos_next as u16, chn);
                    v.next_track = next_track;
                }

                self.get_new_position = false;
            }

            for chn in 0..AMIGA_VOICES {
                self.process_step(chn);
            }
            self.step_wait_frames = self.tempo;
        }

        for chn in 0..AMIGA_VOICES {
            self.process_frame(chn);
        }

        self.step_wait_frames -= 1;
        if self.step_wait_frames == 0 {
            if !self.pattern_break {
                self.note_nr += 1;
                if self.note_nr == i32::from(self.song.track_len) {
                    self.pos_jump = self.pos_nr + 1;
                    self.pattern_break = true;
                }
            }

            if self.pattern_break {
                self.pattern_break = false;
                self.note_nr = self.pos_jump_note;
                self.pos_jump_note = 0;
                self.pos_nr = self.pos_jump;
                self.pos_jump = 0;

                if self.pos_nr == i32::from(self.song.len) {
                    self.pos_nr = i32::from(self.song.restart);
                    self.bump_loop_counter();
                }
                if self.pos_nr >= i32::from(self.song.len) || self.pos_nr < 0 {
                    self.pos_nr = 0;
                    self.bump_loop_counter();
                }

                self.get_new_position = true;
            }
        }
    }

    fn bump_loop_counter(&mut self) {
        if self.loop_counter >= self.loop_times {
            self.finished = true;
        } else {
            self.loop_counter += 1;
        }
    }

    fn setup_audio_channels(&mut self) {
        self.mixer.stop_all_dmas();
        for chn in 0..AMIGA_VOICES {
            self.mixer.set_period(chn, 0x88);
            self.mixer.set_volume(chn, 0);
            self.mixer.set_length(chn, (SAMPLE_RAM_BYTES / 2) as u16);
        }
        self.mixer.start_all_dmas();
    }

    /// Phase 1: write this voice's pending targets to Paula.
    fn commit_voice(&mut self, chn: usize) {
        let waves = self.waves;

        if self.voices[chn].plant_period {
            let period = self.voices[chn].audio_period as u16;
            self.mixer.set_period(chn, period);
            self.voices[chn].plant_period = false;
        }

        if self.voices[chn].new_waveform {
            let v = &self.voices[chn];
            let ram = self.mixer.voice_ram_mut(chn);

            if v.waveform == 3 {
                // Noise fills the whole buffer in one go.
                match v.audio_source {
                    AudioSource::Bank(offset) => {
                        for (i, b) in ram.iter_mut().enumerate() {
                            *b = waves.sample(offset + i);
                        }
                    }
                    _ => ram.fill(0),
                }
            } else {
                // Tile one waveform period across the buffer.
                let cycle = (1usize << v.wavelength) * 4;
                let loops = (1usize << (5 - v.wavelength)) * 5;

                let mut period = [0i8; 0x80];
                match v.audio_source {
                    AudioSource::Bank(offset) => {
                        for (i, b) in period.iter_mut().enumerate().take(cycle) {
                            *b = waves.sample(offset + i);
                        }
                    }
                    AudioSource::SquareScratch => {
                        period[..cycle].copy_from_slice(&v.square_scratch[..cycle]);
                    }
                    AudioSource::Silence => {}
                }

                for k in 0..loops {
                    ram[k * cycle..(k + 1) * cycle].copy_from_slice(&period[..cycle]);
                }
            }

            self.voices[chn].new_waveform = false;
        }

        let volume = self.voices[chn].audio_volume;
        self.mixer.set_volume(chn, volume);
    }

    /// Phase 2: decode one track row for this voice.
    fn process_step(&mut self, chn: usize) {
        let song = self.song;

        {
            let v = &mut self.voices[chn];
            v.volume_slide_up = 0;
            v.volume_slide_down = 0;
        }

        let row = song.track_row(self.voices[chn].track, self.note_nr as u16);
        let mut note = (row[0] >> 2) & 0x3F;
        let instr = ((row[0] & 3) << 4) | (row[1] >> 4);
        let cmd = row[1] & 0xF;
        let param = row[2];

        // ECx note cut / EDx note delay act before everything else; an
        // armed delay swallows the whole step until it expires.
        if cmd == 0xE {
            let e_cmd = param >> 4;
            let e_param = param & 0xF;

            if e_cmd == 0xC && i32::from(e_param) < self.tempo {
                let v = &mut self.voices[chn];
                v.note_cut_wait = e_param;
                v.note_cut_on = true;
                v.hard_cut_release = false;
            }

            if e_cmd == 0xD {
                let v = &mut self.voices[chn];
                if v.note_delay_on {
                    v.note_delay_on = false;
                } else if i32::from(e_param) < self.tempo && e_param != 0 {
                    v.note_delay_wait = e_param;
                    v.note_delay_on = true;
                    return;
                }
            }
        }

        // 0Px: position jump high digit. Clears the low digits too.
        if cmd == 0x0 && param != 0 {
            let pos = param & 0xF;
            if pos <= 9 {
                self.pos_jump = i32::from(pos) << 8;
            }
        }

        // Command 8 is external sync for demos; nothing to do here.

        // Dxx: pattern break into the next position.
        if cmd == 0xD {
            self.pos_jump = self.pos_nr + 1;

            let mut jump_note = i32::from(param >> 4) * 10 + i32::from(param & 0xF);
            if jump_note >= i32::from(song.track_len) {
                jump_note = 0;
            }
            self.pos_jump_note = jump_note;
            self.pattern_break = true;
        }

        // Bxx: position jump, chaining onto a preceding 0Px. Several jumps
        // in one step keep multiplying; out-of-range targets are caught at
        // the position advance.
        if cmd == 0xB {
            self.pos_jump = self
                .pos_jump
                .wrapping_mul(100)
                .wrapping_add(i32::from(param >> 4) * 10 + i32::from(param & 0xF));
            self.pattern_break = true;
        }

        // Fxx: set tempo. Tempo 0 halts stepping and ends bounded renders.
        if cmd == 0xF {
            self.tempo = i32::from(param);
            if self.tempo == 0 {
                self.finished = true;
            }
        }

        // 5xx/Axx: volume slide (5xx also continues tone portamento below).
        if cmd == 0x5 || cmd == 0xA {
            let v = &mut self.voices[chn];
            v.volume_slide_down = param & 0xF;
            v.volume_slide_up = param >> 4;
        }

        if instr > 0 {
            let ins = instrument_or_empty(song, Some(instr));
            let v = &mut self.voices[chn];

            v.perf_sub_volume = 64;

            // reset portamento
            v.period_perf_slide_speed = 0;
            v.period_slide_period = 0;
            v.period_slide_limit = 0;

            // Seed the ADSR envelope; the volume deltas are 8.8 per frame.
            v.adsr = 0;

            v.a_frames = i32::from(ins.a_frames);
            let mut delta = i32::from(ins.a_volume) << 8;
            if v.a_frames != 0 {
                delta /= v.a_frames;
            }
            v.a_delta = delta;

            v.d_frames = i32::from(ins.d_frames);
            delta = (i32::from(ins.d_volume as i8) - i32::from(ins.a_volume as i8)) << 8;
            if v.d_frames != 0 {
                delta /= v.d_frames;
            }
            v.d_delta = delta;

            v.s_frames = i32::from(ins.s_frames);

            v.r_frames = i32::from(ins.r_frames);
            delta = (i32::from(ins.r_volume as i8) - i32::from(ins.d_volume as i8)) << 8;
            if v.r_frames != 0 {
                delta /= v.r_frames;
            }
            v.r_delta = delta;

            v.wavelength = ins.filter_speed_wavelength & 0b0000_0111;
            if v.wavelength > 5 {
                v.wavelength = 5;
            }

            v.note_max_volume = ins.volume;

            v.vibrato_current = 0;
            v.vibrato_delay = ins.vibrato_delay;
            v.vibrato_depth = ins.vibrato_depth & 0b0000_1111;
            v.vibrato_speed = ins.vibrato_speed;
            v.vibrato_period = 0;
            v.hard_cut_release = ins.vibrato_depth & 128 != 0;
            v.hard_cut = (ins.vibrato_depth & 0b0111_0000) >> 4;

            v.ignore_square = false;
            v.square_sliding_in = false;
            v.square_wait = 0;
            v.square_on = false;

            // Limits are stored for wavelength 5 and scale down with it.
            let lower = ins.square_lower_limit >> (5 - v.wavelength);
            let upper = ins.square_upper_limit >> (5 - v.wavelength);
            if lower <= upper {
                v.square_lower_limit = lower;
                v.square_upper_limit = upper;
            } else {
                v.square_lower_limit = upper;
                v.square_upper_limit = lower;
            }

            v.ignore_filter = 0;
            v.filter_wait = 0;
            v.filter_on = false;
            v.filter_sliding_in = false;

            // Filter speed is 6 bits, split across three header bytes.
            v.filter_speed = ins.filter_speed_wavelength >> 3;
            let mut lower = ins.filter_lower_limit;
            let mut upper = ins.filter_upper_limit;
            if lower & 128 != 0 {
                v.filter_speed |= 32;
            }
            if upper & 128 != 0 {
                v.filter_speed |= 64;
            }
            lower &= !128;
            upper &= !128;
            if lower <= upper {
                v.filter_lower_limit = lower;
                v.filter_upper_limit = upper;
            } else {
                v.filter_lower_limit = upper;
                v.filter_upper_limit = lower;
            }

            v.filter_pos = 32; // unfiltered
            v.perf_wait = 0;
            v.perf_speed = ins.perf_speed;
            v.perf_current = 0;
            v.instrument = Some(instr);
        }

        // 9xx: square offset; also mutes the next perf-list square init.
        if cmd == 0x9 {
            let v = &mut self.voices[chn];
            v.square_pos = param >> (5 - v.wavelength);
            v.plant_square = true;
            v.ignore_square = true;
        }

        // 4xx: override filter. Below 0x40 it stashes the position for the
        // next perf-list filter init instead of applying it now.
        if cmd == 0x4 {
            let v = &mut self.voices[chn];
            if param < 0x40 {
                v.ignore_filter = param;
            } else {
                v.filter_pos = param - 0x40;
            }
        }

        self.voices[chn].period_slide_on = false;

        // 3xx/5xx: tone portamento. A slide to the note already playing is
        // not armed at all.
        if cmd == 0x3 || cmd == 0x5 {
            let v = &mut self.voices[chn];
            if cmd == 0x3 && param != 0 {
                v.period_slide_speed = i16::from(param);
            }

            let mut do_slide = true;
            if note != 0 {
                let period_limit = period_at(v.track_period) - period_at(i16::from(note));
                let test = (period_limit as u16).wrapping_add(v.period_slide_period as u16);
                if test == 0 {
                    do_slide = false;
                } else {
                    v.period_slide_limit = period_limit.wrapping_neg();
                }
            }

            if do_slide {
                v.period_slide_on = true;
                v.period_slide_with_limit = true;
                note = 0; // the slide owns the note
            }
        }

        if note != 0 {
            let v = &mut self.voices[chn];
            v.track_period = i16::from(note);
            v.plant_period = true;
        }

        // 1xx/2xx: free-running portamento.
        if cmd == 0x1 {
            let v = &mut self.voices[chn];
            v.period_slide_speed = -i16::from(param);
            v.period_slide_on = true;
            v.period_slide_with_limit = false;
        }
        if cmd == 0x2 {
            let v = &mut self.voices[chn];
            v.period_slide_speed = i16::from(param);
            v.period_slide_on = true;
            v.period_slide_with_limit = false;
        }

        // Remaining enhanced commands.
        if cmd == 0xE {
            let e_cmd = param >> 4;
            let e_param = param & 0xF;
            let v = &mut self.voices[chn];

            if e_cmd == 0x1 {
                v.period_slide_period = v.period_slide_period.wrapping_sub(i16::from(e_param));
                v.plant_period = true;
            }
            if e_cmd == 0x2 {
                v.period_slide_period = v.period_slide_period.wrapping_add(i16::from(e_param));
                v.plant_period = true;
            }
            if e_cmd == 0x4 {
                v.vibrato_depth = e_param;
            }
            if e_cmd == 0xA {
                v.note_max_volume = v.note_max_volume.wrapping_add(e_param);
                if v.note_max_volume > 0x40 {
                    v.note_max_volume = 0x40;
                }
            }
            if e_cmd == 0xB {
                v.note_max_volume = v.note_max_volume.wrapping_sub(e_param);
                if (v.note_max_volume as i8) < 0 {
                    v.note_max_volume = 0;
                }
            }
        }

        // Cxx: set volume. 0x50..0x90 hits every voice's track master.
        if cmd == 0xC {
            let p = i16::from(param);
            if p <= 0x40 {
                self.voices[chn].note_max_volume = p as u8;
            } else {
                let p = p - 0x50;
                if p >= 0 {
                    if p <= 0x40 {
                        for v in &mut self.voices {
                            v.track_master_volume = p as u8;
                        }
                    } else {
                        let p = p - (0xA0 - 0x50);
                        if (0..=0x40).contains(&p) {
                            self.voices[chn].track_master_volume = p as u8;
                        }
                    }
                }
            }
        }
    }

    /// Phase 3: the per-tick voice processing.
    fn process_frame(&mut self, chn: usize) {
        let song = self.song;
        let waves = self.waves;

        // Hard cut: when the next step retriggers, schedule a note cut
        // near the end of this one.
        if self.voices[chn].hard_cut != 0 {
            let mut track = self.voices[chn].track;
            let mut note_nr = self.note_nr + 1;
            if note_nr == i32::from(song.track_len) {
                note_nr = 0;
                track = self.voices[chn].next_track;
            }

            let row = song.track_row(track, note_nr as u16);
            let next_instr = ((row[0] & 3) << 4) | (row[1] >> 4);
            if next_instr != 0 {
                let tempo = self.tempo;
                let v = &mut self.voices[chn];

                let mut range = tempo - i32::from(v.hard_cut);
                if range < 0 {
                    range = 0;
                }

                if !v.note_cut_on {
                    v.note_cut_on = true;
                    v.note_cut_wait = range as u8;
                    v.hard_cut_release_frames = tempo - range;
                }

                v.hard_cut = 0;
            }
        }

        if self.voices[chn].note_cut_on {
            if self.voices[chn].note_cut_wait == 0 {
                self.voices[chn].note_cut_on = false;

                if self.voices[chn].hard_cut_release {
                    // Exponential-ish release down to the instrument's
                    // release volume across the remaining ticks.
                    let ins = instrument_or_empty(song, self.voices[chn].instrument);
                    let v = &mut self.voices[chn];

                    v.r_frames = v.hard_cut_release_frames;
                    v.r_delta = if v.hard_cut_release_frames == 0 {
                        0
                    } else {
                        -((v.adsr - (i32::from(ins.r_volume) << 8)) / v.hard_cut_release_frames)
                    };
                    v.a_frames = 0;
                    v.d_frames = 0;
                    v.s_frames = 0;
                } else {
                    self.voices[chn].note_max_volume = 0;
                }
            }

            let v = &mut self.voices[chn];
            v.note_cut_wait = v.note_cut_wait.wrapping_sub(1);
        }

        if self.voices[chn].note_delay_on {
            if self.voices[chn].note_delay_wait == 0 {
                self.process_step(chn);
            } else {
                self.voices[chn].note_delay_wait -= 1;
            }
        }

        // ADSR, one stage at a time. Hitting a stage boundary snaps the
        // accumulator to the exact target to cancel delta rounding.
        {
            let ins = instrument_or_empty(song, self.voices[chn].instrument);
            let v = &mut self.voices[chn];

            if v.a_frames != 0 {
                v.adsr += v.a_delta;
                v.a_frames -= 1;
                if v.a_frames == 0 {
                    v.adsr = i32::from(ins.a_volume) << 8;
                }
            } else if v.d_frames != 0 {
                v.adsr += v.d_delta;
                v.d_frames -= 1;
                if v.d_frames == 0 {
                    v.adsr = i32::from(ins.d_volume) << 8;
                }
            } else if v.s_frames != 0 {
                v.s_frames -= 1;
            } else if v.r_frames != 0 {
                v.adsr += v.r_delta;
                v.r_frames -= 1;
                if v.r_frames == 0 {
                    v.adsr = i32::from(ins.r_volume) << 8;
                }
            }
        }

        {
            let v = &mut self.voices[chn];

            // Volume slide, clamped through the sign of the wrapped byte.
            v.note_max_volume = v
                .note_max_volume
                .wrapping_sub(v.volume_slide_down)
                .wrapping_add(v.volume_slide_up);
            v.note_max_volume = (v.note_max_volume as i8).clamp(0, 0x40) as u8;

            // Portamento. The limited variant detects overshoot by the
            // sign flip of (period + speed) XOR period.
            if v.period_slide_on {
                if v.period_slide_with_limit {
                    let mut speed = v.period_slide_speed;

                    let period = v.period_slide_period.wrapping_sub(v.period_slide_limit);
                    if period != 0 {
                        if period > 0 {
                            speed = speed.wrapping_neg();
                        }

                        let limit_test = period.wrapping_add(speed) ^ period;
                        if limit_test >= 0 {
                            v.period_slide_period = v.period_slide_period.wrapping_add(speed);
                        } else {
                            v.period_slide_period = v.period_slide_limit;
                        }

                        v.plant_period = true;
                    }
                } else {
                    v.period_slide_period = v.period_slide_period.wrapping_add(v.period_slide_speed);
                    v.plant_period = true;
                }
            }

            // Vibrato.
            if v.vibrato_depth != 0 {
                if v.vibrato_delay != 0 {
                    v.vibrato_delay -= 1;
                } else {
                    let sine = i32::from(VIB_TABLE[usize::from(v.vibrato_current & 63)]);
                    v.vibrato_period = ((sine * i32::from(v.vibrato_depth)) >> 7) as i16;
                    v.plant_period = true;
                    v.vibrato_current = v.vibrato_current.wrapping_add(v.vibrato_speed) & 63;
                }
            }
        }

        // Perf list: one row per perf-speed ticks while rows remain; after
        // the end, only the wait keeps counting and then perf slides stop.
        if let Some(number) = self.voices[chn].instrument {
            let ins = instrument_or_empty(song, Some(number));
            let v = &mut self.voices[chn];

            if v.perf_current == ins.perf_length {
                if v.perf_wait != 0 {
                    v.perf_wait -= 1;
                } else {
                    v.period_perf_slide_speed = 0;
                }
            } else {
                // Perf speed 0x80 underflows the signed wait byte before
                // the comparison and must not delay (68k BGT takes the
                // V flag into account; songs rely on it).
                let signed_overflow = v.perf_wait == 128;
                v.perf_wait = v.perf_wait.wrapping_sub(1);
                if signed_overflow || (v.perf_wait as i8) <= 0 {
                    let row = ins.perf_list[usize::from(v.perf_current)];

                    let cmd2 = (row[0] >> 5) & 7;
                    let cmd1 = (row[0] >> 2) & 7;
                    let wave = ((row[0] << 1) & 6) | (row[1] >> 7);
                    let fixed = (row[1] >> 6) & 1 != 0;
                    let note = row[1] & 0x3F;
                    let param1 = row[2];
                    let param2 = row[3];

                    if wave != 0 {
                        // 1-based on disk; select and reset the perf slide.
                        v.waveform = (wave - 1).min(3);
                        v.new_waveform = true;
                        v.period_perf_slide_speed = 0;
                        v.period_perf_slide_period = 0;
                    }

                    v.period_perf_slide_on = false;

                    v.plist_command(cmd1, param1);
                    v.plist_command(cmd2, param2);

                    if note != 0 {
                        v.instr_period = i16::from(note);
                        v.plant_period = true;
                        v.fixed_note = fixed;
                    }

                    v.perf_current = v.perf_current.wrapping_add(1);
                    v.perf_wait = v.perf_speed;
                }
            }
        }

        // Perf portamento.
        {
            let v = &mut self.voices[chn];
            if v.period_perf_slide_on {
                v.period_perf_slide_period =
                    v.period_perf_slide_period.wrapping_sub(v.period_perf_slide_speed);
                if v.period_perf_slide_period != 0 {
                    v.plant_period = true;
                }
            }
        }

        // Square modulation: bounce the duty-cycle position between its
        // limits. "Sliding in" covers a start position outside them.
        {
            let square_speed = instrument_or_empty(song, self.voices[chn].instrument).square_speed;
            let v = &mut self.voices[chn];

            if v.waveform == 2 && v.square_on {
                v.square_wait = v.square_wait.wrapping_sub(1);
                if (v.square_wait as i8) <= 0 {
                    if v.square_init {
                        v.square_init = false;

                        if (v.square_pos as i8) <= (v.square_lower_limit as i8) {
                            v.square_sliding_in = true;
                            v.square_signum = 1;
                        } else if (v.square_pos as i8) >= (v.square_upper_limit as i8) {
                            v.square_sliding_in = true;
                            v.square_signum = -1;
                        }
                    }

                    if v.square_pos == v.square_lower_limit || v.square_pos == v.square_upper_limit
                    {
                        if v.square_sliding_in {
                            v.square_sliding_in = false;
                        } else {
                            v.square_signum = v.square_signum.wrapping_neg();
                        }
                    }

                    v.square_pos = v.square_pos.wrapping_add(v.square_signum as u8);
                    v.plant_square = true;
                    v.square_wait = square_speed;
                }
            }
        }

        // Filter modulation. Low speeds run multiple steps per tick.
        {
            let v = &mut self.voices[chn];

            if v.filter_on {
                v.filter_wait = v.filter_wait.wrapping_sub(1);
                if (v.filter_wait as i8) <= 0 {
                    if v.filter_init {
                        v.filter_init = false;

                        if (v.filter_pos as i8) <= (v.filter_lower_limit as i8) {
                            v.filter_sliding_in = true;
                            v.filter_signum = 1;
                        } else if (v.filter_pos as i8) >= (v.filter_upper_limit as i8) {
                            v.filter_sliding_in = true;
                            v.filter_signum = -1;
                        }
                    }

                    let cycles = if v.filter_speed < 4 {
                        5 - i32::from(v.filter_speed)
                    } else {
                        1
                    };
                    for _ in 0..cycles {
                        if v.filter_pos == v.filter_lower_limit
                            || v.filter_pos == v.filter_upper_limit
                        {
                            if v.filter_sliding_in {
                                v.filter_sliding_in = false;
                            } else {
                                v.filter_signum = v.filter_signum.wrapping_neg();
                            }
                        }

                        v.filter_pos = v.filter_pos.wrapping_add(v.filter_signum as u8);
                    }

                    v.new_waveform = true;

                    v.filter_wait = v.filter_speed.wrapping_sub(3);
                    if (v.filter_wait as i8) < 1 {
                        v.filter_wait = 1;
                    }
                }
            }
        }

        // Square rendering: resample one duty cycle from the filtered
        // square bank into the voice's scratch buffer.
        if self.voices[chn].waveform == 2 || self.voices[chn].plant_square {
            let filter_pos = self.voices[chn].filter_pos;
            let src_base = if filter_pos == 0 || filter_pos > 63 {
                None // out-of-range filter reads the zero section
            } else {
                let offset = WaveBank::squares_offset() as i64
                    + (i64::from(filter_pos) - 32) * FILTER_SECTION_LEN as i64;
                Some(offset as usize)
            };

            let v = &mut self.voices[chn];

            let mut which_square =
                ((u32::from(v.square_pos)) << (5 - u32::from(v.wavelength))) as u8;
            if (which_square as i8) > 0x20 {
                which_square = 0x40u8.wrapping_sub(which_square);
            }
            which_square = which_square.wrapping_sub(1);
            if (which_square as i8) < 0 {
                which_square = 0;
            }

            let step = 32usize >> v.wavelength;
            let cycle_bytes = (1usize << v.wavelength) << 2;

            for i in 0..cycle_bytes {
                v.square_scratch[i] = match src_base {
                    Some(base) => {
                        waves.sample(base + (usize::from(which_square) << 7) + i * step)
                    }
                    None => 0,
                };
            }

            v.new_waveform = true;
            v.plant_square = false;
        }

        // Noise restreams a fresh window every tick.
        if self.voices[chn].waveform == 3 {
            self.voices[chn].new_waveform = true;
        }

        // Pick the source the next register commit will plant.
        if self.voices[chn].new_waveform {
            let filter_pos = self.voices[chn].filter_pos;
            let waveform = self.voices[chn].waveform;

            let source = if waveform == 2 {
                AudioSource::SquareScratch
            } else if filter_pos == 0 || filter_pos > 63 {
                if waveform == 3 {
                    self.wn_random = advance_noise_seed(self.wn_random);
                }
                AudioSource::Silence
            } else {
                let base = match waveform {
                    0 => WaveBank::triangle_offset(),
                    1 => WaveBank::sawtooth_offset(),
                    _ => WaveBank::noise_offset(),
                };
                let mut offset =
                    base as i64 + (i64::from(filter_pos) - 32) * FILTER_SECTION_LEN as i64;

                if waveform < 2 {
                    offset += WAVE_OFFSETS[usize::from(self.voices[chn].wavelength)] as i64;
                }
                if waveform == 3 {
                    offset += i64::from(self.wn_random & NOISE_WINDOW_MASK);
                    self.wn_random = advance_noise_seed(self.wn_random);
                }

                AudioSource::Bank(offset as usize)
            };

            self.voices[chn].audio_source = source;
        }

        // Final period. Transposition routinely drives the note negative;
        // those notes read the words in front of the period table.
        {
            let v = &mut self.voices[chn];

            let mut note = v.instr_period;
            if !v.fixed_note {
                note += i16::from(v.transpose);
                note += v.track_period - 1;
            }

            if note > 5 * 12 {
                note = 5 * 12;
            }

            let mut period = if note < 0 {
                if note < -129 {
                    note = -129;
                }
                BEFORE_PERIOD_TABLE[(note + 129) as usize] as i16
            } else {
                PERIOD_TABLE[note as usize]
            };

            if !v.fixed_note {
                period = period.wrapping_add(v.period_slide_period);
            }
            period = period
                .wrapping_add(v.period_perf_slide_period)
                .wrapping_add(v.vibrato_period);

            v.audio_period = period.clamp(113, 3424);

            // Final volume: envelope scaled by three nested 6-bit gains.
            let mut final_vol = (v.adsr >> 8) as u16;
            final_vol = final_vol.wrapping_mul(u16::from(v.note_max_volume)) >> 6;
            final_vol = final_vol.wrapping_mul(u16::from(v.perf_sub_volume)) >> 6;
            final_vol = final_vol.wrapping_mul(u16::from(v.track_master_volume)) >> 6;
            v.audio_volume = final_vol;
        }
    }
}

fn instrument_or_empty<'s>(song: &'s Song, number: Option<u8>) -> &'s Instrument {
    match number {
        Some(n) => song.instrument(n).unwrap_or(&EMPTY_INSTRUMENT),
        None => &EMPTY_INSTRUMENT,
    }
}

/// Period lookup for the portamento setup. Note values are six bits wide
/// while the table holds 61 entries; the overhang clamps to the last one.
fn period_at(note: i16) -> i16 {
    PERIOD_TABLE[usize::from(note.clamp(0, 60) as u16)]
}

/// Advance the replayer's noise-window seed.
fn advance_noise_seed(seed: u32) -> u32 {
    let mut seed = seed.wrapping_add(2_239_384);
    seed = seed.rotate_right(8);
    seed = seed.wrapping_add(782_323);
    seed ^= 0b100_1011;
    seed.wrapping_sub(6735)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestModule {
        revision: u8,
        restart: u16,
        track_len: u8,
        cia_index: u8,
        positions: Vec<[(u8, i8); 4]>,
        tracks: Vec<Vec<[u8; 3]>>,
        instruments: Vec<([u8; 22], Vec<[u8; 4]>)>,
    }

    impl TestModule {
        fn new() -> Self {
            Self {
                revision: 1,
                restart: 0,
                track_len: 4,
                cia_index: 0,
                positions: vec![[(0, 0); 4]],
                tracks: vec![Vec::new()],
                instruments: Vec::new(),
            }
        }

        fn bytes(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(b"THX");
            out.push(self.revision);
            out.extend_from_slice(&[0, 0]);
            let flags = (u16::from(self.cia_index) << 13) | self.positions.len() as u16;
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&self.restart.to_be_bytes());
            out.push(self.track_len);
            out.push((self.tracks.len() - 1) as u8);
            out.push(self.instruments.len() as u8);
            out.push(0); // subsongs
            for pos in &self.positions {
                for &(track, transpose) in pos {
                    out.push(track);
                    out.push(transpose as u8);
                }
            }
            for track in &self.tracks {
                for row in 0..usize::from(self.track_len) {
                    out.extend_from_slice(&track.get(row).copied().unwrap_or([0; 3]));
                }
            }
            for (header, rows) in &self.instruments {
                let mut header = *header;
                header[21] = rows.len() as u8;
                out.extend_from_slice(&header);
                for row in rows {
                    out.extend_from_slice(row);
                }
            }
            out
        }

        fn song(&self) -> Song {
            Song::from_bytes(&self.bytes()).expect("valid test module")
        }
    }

    fn note_row(note: u8, instr: u8, cmd: u8, param: u8) -> [u8; 3] {
        [
            (note << 2) | (instr >> 4),
            ((instr & 0xF) << 4) | (cmd & 0xF),
            param,
        ]
    }

    fn perf_row(cmd2: u8, cmd1: u8, wave: u8, fixed: bool, note: u8, p1: u8, p2: u8) -> [u8; 4] {
        [
            ((cmd2 & 7) << 5) | ((cmd1 & 7) << 2) | (wave >> 1),
            ((wave & 1) << 7) | (u8::from(fixed) << 6) | (note & 0x3F),
            p1,
            p2,
        ]
    }

    /// Sustained sawtooth instrument: instant attack to full volume.
    fn basic_instrument() -> [u8; 22] {
        let mut h = [0u8; 22];
        h[0] = 64; // volume
        h[1] = 4; // wavelength 4
        h[2] = 1; // attack frames
        h[3] = 64; // attack volume
        h[4] = 1; // decay frames
        h[5] = 64; // decay volume
        h[6] = 255; // sustain frames
        h[7] = 1; // release frames
        h[12] = 1; // filter lower limit
        h[16] = 0x20; // square lower limit
        h[17] = 0x3F; // square upper limit
        h[18] = 1; // square speed
        h[19] = 0x1F; // filter upper limit
        h[20] = 1; // perf speed
        h
    }

    fn saw_perf() -> Vec<[u8; 4]> {
        // Select sawtooth, base note 1.
        vec![perf_row(0, 0, 2, false, 1, 0, 0)]
    }

    #[test]
    fn bpm_follows_cia_period_index() {
        let mut module = TestModule::new();
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);

        // Index 0: period 14209, ~49.92 Hz tick, ~124.8 BPM.
        assert!((player.bpm() - 124.8).abs() < 0.01, "bpm = {}", player.bpm());
    }

    #[test]
    fn negative_note_reads_underflow_table() {
        let mut module = TestModule::new();
        // Perf note 1 and track note 1 with transpose -2: final note is
        // 1 + (-2) + (1 - 1) = -1, one word before the period table.
        module.positions[0][0] = (0, -2);
        module.tracks[0] = vec![note_row(1, 1, 0, 0)];
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);
        player.tick();
        player.tick(); // perf row (note 1) consumed on the first frame

        // Underflow entry 128 is 0x5E68, clamped to 3424. A plain
        // periodTable[0] read would clamp up to 113 instead.
        assert_eq!(player.voices[0].audio_period, 3424);
    }

    #[test]
    fn tone_portamento_to_same_note_is_not_armed() {
        let mut module = TestModule::new();
        module.tracks[0] = vec![
            note_row(1, 1, 0, 0),
            note_row(1, 0, 3, 1), // slide to the note already playing
        ];
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);

        for _ in 0..6 {
            player.tick(); // row 0
        }
        let period_before = player.voices[0].audio_period;
        player.tick(); // row 1: the 3xx

        assert!(!player.voices[0].period_slide_on);
        assert_eq!(player.voices[0].audio_period, period_before);
    }

    #[test]
    fn square_modulation_with_degenerate_limits_stays_sane() {
        let mut module = TestModule::new();
        module.track_len = 64;
        let mut instrument = basic_instrument();
        instrument[1] = 0; // wavelength 0: limits shift down by 5
        instrument[16] = 0x20; // lower limit 1 after shift
        instrument[17] = 0x20; // upper limit 1 after shift
        module.tracks[0] = vec![note_row(13, 1, 0, 0)];
        module.instruments.push((
            instrument,
            vec![
                perf_row(0, 0, 3, false, 1, 0, 0), // square waveform
                perf_row(0, 4, 0, false, 0, 0, 0), // toggle modulation on
            ],
        ));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);

        for _ in 0..200 {
            player.tick();
            let v = &player.voices[0];
            assert!(v.audio_volume <= 64, "volume {}", v.audio_volume);
            assert!(
                (113..=3424).contains(&v.audio_period),
                "period {}",
                v.audio_period
            );
        }
        assert!(player.voices[0].square_on);
    }

    #[test]
    fn pattern_breaks_cycle_through_restart_and_count_loops() {
        let mut module = TestModule::new();
        module.positions = vec![[(0, 0); 4]; 4];
        module.restart = 1;
        module.tracks[0] = vec![note_row(0, 0, 0xD, 0)];
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);
        player.set_loop_times(10);

        let mut positions = Vec::new();
        for _ in 0..8 {
            for _ in 0..6 {
                player.tick();
            }
            positions.push(player.position());
        }

        assert_eq!(positions, [1, 2, 3, 1, 2, 3, 1, 2]);
        assert_eq!(player.loop_counter(), 2);
        assert!(!player.finished());
    }

    #[test]
    fn commit_clears_plant_flags() {
        let mut module = TestModule::new();
        module.tracks[0] = vec![note_row(25, 1, 0, 0)];
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);

        player.tick(); // step + frame raise the plant flags
        assert!(player.voices[0].plant_period);
        assert!(player.voices[0].new_waveform);

        player.tick(); // commit phase runs first and consumes them
        assert!(!player.voices[0].plant_period);
        assert!(!player.voices[0].new_waveform);
        assert!(!player.voices[0].plant_square);
    }

    #[test]
    fn set_tempo_zero_finishes_the_song() {
        let mut module = TestModule::new();
        module.tracks[0] = vec![note_row(0, 0, 0xF, 0)];
        module.instruments.push((basic_instrument(), saw_perf()));
        let song = module.song();
        let waves = WaveBank::build();
        let mut player = Player::new(&song, &waves, 48_000);
        player.play(0);
        assert!(!player.finished());
        player.tick();
        assert!(player.finished());
    }
}
