//! Per-voice replayer state and the perf-list command interpreter.

/// Where the voice's next waveform comes from when the register-commit
/// phase plants it into Paula sample RAM.
#[derive(Clone, Copy)]
pub(crate) enum AudioSource {
    /// Out-of-range filter position: an all-zero filter section.
    Silence,
    /// Byte offset into the waveform bank.
    Bank(usize),
    /// The voice's own rendered square cycle.
    SquareScratch,
}

/// Per-voice tracker state, reset whenever playback (re)starts.
///
/// Field widths mirror the original's register usage: the wait counters
/// wrap as bytes and several comparisons are done on the sign bit of the
/// wrapped value, which real songs depend on.
pub(crate) struct VoiceTemp {
    pub track: u8,
    pub transpose: i8,
    /// Track at the next position, peeked by the hard-cut scheduler.
    pub next_track: u8,

    /// 8.8 fixed-point envelope level.
    pub adsr: i32,
    pub a_frames: i32,
    pub a_delta: i32,
    pub d_frames: i32,
    pub d_delta: i32,
    pub s_frames: i32,
    pub r_frames: i32,
    pub r_delta: i32,

    pub note_max_volume: u8,
    pub perf_sub_volume: u8,
    pub track_master_volume: u8,
    pub volume_slide_up: u8,
    pub volume_slide_down: u8,

    pub period_slide_speed: i16,
    pub period_slide_period: i16,
    pub period_slide_limit: i16,
    pub period_slide_on: bool,
    pub period_slide_with_limit: bool,

    pub period_perf_slide_speed: i16,
    pub period_perf_slide_period: i16,
    pub period_perf_slide_on: bool,

    pub vibrato_current: u8,
    pub vibrato_delay: u8,
    pub vibrato_depth: u8,
    pub vibrato_speed: u8,
    pub vibrato_period: i16,

    pub hard_cut_release: bool,
    pub hard_cut: u8,
    pub hard_cut_release_frames: i32,

    pub note_cut_on: bool,
    pub note_cut_wait: u8,
    pub note_delay_on: bool,
    pub note_delay_wait: u8,

    pub ignore_square: bool,
    /// Doubles as flag and stashed position, like the original.
    pub ignore_filter: u8,

    pub square_on: bool,
    pub square_init: bool,
    pub square_sliding_in: bool,
    pub square_wait: u8,
    pub square_pos: u8,
    pub square_signum: i8,
    pub square_lower_limit: u8,
    pub square_upper_limit: u8,
    pub plant_square: bool,

    pub filter_on: bool,
    pub filter_init: bool,
    pub filter_sliding_in: bool,
    pub filter_wait: u8,
    pub filter_pos: u8,
    pub filter_signum: i8,
    pub filter_lower_limit: u8,
    pub filter_upper_limit: u8,
    pub filter_speed: u8,

    /// Selected waveform: 0 triangle, 1 sawtooth, 2 square, 3 noise.
    pub waveform: u8,
    /// Power-of-two length selector, 0..=5.
    pub wavelength: u8,

    /// 1-based instrument number of the current instrument, if any was
    /// ever triggered. Out-of-range numbers resolve to the shared empty
    /// instrument.
    pub instrument: Option<u8>,
    /// Perf row cursor; wraps as a byte and indexes the zero-padded list.
    pub perf_current: u8,
    pub perf_wait: u8,
    pub perf_speed: u8,

    pub fixed_note: bool,
    pub instr_period: i16,
    pub track_period: i16,

    pub plant_period: bool,
    pub new_waveform: bool,

    pub audio_period: i16,
    pub audio_volume: u16,
    pub audio_source: AudioSource,

    /// One rendered square cycle, resampled from the duty-cycle bank.
    pub square_scratch: [i8; 0x80],
}

impl VoiceTemp {
    pub fn new() -> Self {
        Self {
            track: 0,
            transpose: 0,
            next_track: 0,
            adsr: 0,
            a_frames: 0,
            a_delta: 0,
            d_frames: 0,
            d_delta: 0,
            s_frames: 0,
            r_frames: 0,
            r_delta: 0,
            note_max_volume: 0,
            perf_sub_volume: 0,
            track_master_volume: 64,
            volume_slide_up: 0,
            volume_slide_down: 0,
            period_slide_speed: 0,
            period_slide_period: 0,
            period_slide_limit: 0,
            period_slide_on: false,
            period_slide_with_limit: false,
            period_perf_slide_speed: 0,
            period_perf_slide_period: 0,
            period_perf_slide_on: false,
            vibrato_current: 0,
            vibrato_delay: 0,
            vibrato_depth: 0,
            vibrato_speed: 0,
            vibrato_period: 0,
            hard_cut_release: false,
            hard_cut: 0,
            hard_cut_release_frames: 0,
            note_cut_on: false,
            note_cut_wait: 0,
            note_delay_on: false,
            note_delay_wait: 0,
            ignore_square: false,
            ignore_filter: 0,
            square_on: false,
            square_init: false,
            square_sliding_in: false,
            square_wait: 0,
            square_pos: 0,
            square_signum: 1,
            square_lower_limit: 1,
            square_upper_limit: 63,
            plant_square: false,
            filter_on: false,
            filter_init: false,
            filter_sliding_in: false,
            filter_wait: 0,
            filter_pos: 0,
            filter_signum: 0,
            filter_lower_limit: 0,
            filter_upper_limit: 0,
            filter_speed: 0,
            waveform: 0,
            wavelength: 0,
            instrument: None,
            perf_current: 0,
            perf_wait: 0,
            perf_speed: 0,
            fixed_note: false,
            instr_period: 0,
            track_period: 0,
            plant_period: false,
            new_waveform: false,
            audio_period: 0,
            audio_volume: 0,
            audio_source: AudioSource::Silence,
            square_scratch: [0; 0x80],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// One perf-list command. Two of these run per consumed perf row.
    pub fn plist_command(&mut self, cmd: u8, param: u8) {
        match cmd {
            // Init filter modulation. 0-00 is still nothing.
            0 => {
                if param == 0 {
                    return;
                }
                if self.ignore_filter != 0 {
                    self.filter_pos = self.ignore_filter;
                    self.ignore_filter = 0;
                } else {
                    self.filter_pos = param;
                    self.new_waveform = true;
                }
            }
            // Perf slide up / down.
            1 => {
                self.period_perf_slide_speed = i16::from(param);
                self.period_perf_slide_on = true;
            }
            2 => {
                self.period_perf_slide_speed = -i16::from(param);
                self.period_perf_slide_on = true;
            }
            // Init square modulation, unless a 9xx asked us not to.
            3 => {
                if self.ignore_square {
                    self.ignore_square = false;
                } else {
                    self.square_pos = param >> (5 - self.wavelength);
                }
            }
            // Start/stop modulation. Param 0 toggles square only
            // (downwards compatible); otherwise the low nibble drives the
            // square and the high nibble the filter, with nibble value 0xF
            // flipping the direction.
            4 => {
                if param == 0 {
                    self.square_on = !self.square_on;
                    self.square_init = self.square_on;
                    self.square_signum = 1;
                } else {
                    if param & 0x0F != 0 {
                        self.square_on = !self.square_on;
                        self.square_init = self.square_on;
                        self.square_signum = 1;
                        if param & 0x0F == 0x0F {
                            self.square_signum = -1;
                        }
                    }
                    if param & 0xF0 != 0 {
                        self.filter_on = !self.filter_on;
                        self.filter_init = self.filter_on;
                        self.filter_signum = 1;
                        if param & 0xF0 == 0xF0 {
                            self.filter_signum = -1;
                        }
                    }
                }
            }
            // Jump to perf step. Not range checked; jumps past the stored
            // rows land in the zero padding (param 0 wraps to row 255).
            5 => {
                self.perf_current = param.wrapping_sub(1);
            }
            // Set volume, same bands as pattern command C but with the
            // middle band driving the perf sub-volume.
            6 => {
                let mut p = i16::from(param);
                if p <= 0x40 {
                    self.note_max_volume = p as u8;
                } else {
                    p -= 0x50;
                    if p >= 0 {
                        if p <= 0x40 {
                            self.perf_sub_volume = p as u8;
                        } else {
                            p -= 0xA0 - 0x50;
                            if (0..=0x40).contains(&p) {
                                self.track_master_volume = p as u8;
                            }
                        }
                    }
                }
            }
            // Set perf speed.
            7 => {
                self.perf_speed = param;
                self.perf_wait = param;
            }
            _ => {}
        }
    }
}
