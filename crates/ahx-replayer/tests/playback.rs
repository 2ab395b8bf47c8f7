//! End-to-end playback tests against a small synthetic module.

use ahx_replayer::Player;
use ahx_replayer::ahx_waves::WaveBank;
use ahx_replayer::format_ahx::{AhxError, Song};

/// Two positions over two tracks, one sawtooth instrument with a perf
/// slide, plus portamento and volume commands, so a render touches most of
/// the tick machinery.
fn demo_module() -> Vec<u8> {
    let note_row = |note: u8, instr: u8, cmd: u8, param: u8| -> [u8; 3] {
        [
            (note << 2) | (instr >> 4),
            ((instr & 0xF) << 4) | (cmd & 0xF),
            param,
        ]
    };

    let mut out = Vec::new();
    out.extend_from_slice(b"THX");
    out.push(1); // revision
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&2u16.to_be_bytes()); // flags: length 2
    out.extend_from_slice(&0u16.to_be_bytes()); // restart
    out.push(4); // track length
    out.push(1); // highest track
    out.push(1); // instruments
    out.push(0); // subsongs

    // Position table: track 0 straight, track 1 transposed down an octave.
    out.extend_from_slice(&[0, 0, 1, 0, 0, 12, 1, 0xF4]);
    out.extend_from_slice(&[1, 0, 0, 0, 1, 12, 0, 0]);

    // Track 0: note, portamento down, volume, note again.
    out.extend_from_slice(&note_row(25, 1, 0, 0));
    out.extend_from_slice(&note_row(30, 0, 0x2, 2));
    out.extend_from_slice(&note_row(0, 0, 0xC, 0x30));
    out.extend_from_slice(&note_row(20, 1, 0, 0));

    // Track 1: one held note.
    out.extend_from_slice(&note_row(13, 1, 0, 0));
    out.extend_from_slice(&[0; 9]);

    // Instrument: sustained sawtooth, perf list selects the waveform and
    // nudges the pitch.
    let mut header = [0u8; 22];
    header[0] = 64; // volume
    header[1] = 4; // wavelength
    header[2] = 1; // attack frames
    header[3] = 64; // attack volume
    header[4] = 1; // decay frames
    header[5] = 64; // decay volume
    header[6] = 255; // sustain frames
    header[7] = 1; // release frames
    header[12] = 1; // filter lower limit
    header[16] = 0x20; // square lower limit
    header[17] = 0x3F; // square upper limit
    header[18] = 1; // square speed
    header[19] = 0x1F; // filter upper limit
    header[20] = 1; // perf speed
    header[21] = 2; // perf rows
    out.extend_from_slice(&header);
    out.extend_from_slice(&[0b0000_0001, 0x01, 0, 0]); // sawtooth, note 1
    out.extend_from_slice(&[0b0000_0100, 0x00, 2, 0]); // perf slide up by 2
    out.extend_from_slice(b"demo\0");
    out
}

#[test]
fn rejects_unknown_revision() {
    let mut data = demo_module();
    data[3] = 2;
    assert!(matches!(Song::from_bytes(&data), Err(AhxError::NotAnAhx)));
}

#[test]
fn renders_audible_samples() {
    let song = Song::from_bytes(&demo_module()).expect("valid module");
    let waves = WaveBank::build();
    let mut player = Player::new(&song, &waves, 48_000);
    player.play(0);

    let mut stream = vec![0i16; 8000];
    player.render(&mut stream);

    assert!(
        stream.iter().any(|&s| s != 0),
        "a triggered sawtooth should be audible"
    );
    assert_eq!(song.name(), "demo");
}

#[test]
fn split_renders_are_byte_identical() {
    let song = Song::from_bytes(&demo_module()).expect("valid module");
    let waves = WaveBank::build();

    let mut one_shot = Player::new(&song, &waves, 48_000);
    one_shot.play(0);
    let mut whole = vec![0i16; 18_000];
    one_shot.render(&mut whole);

    let mut chunked = Player::new(&song, &waves, 48_000);
    chunked.play(0);
    let mut parts = vec![0i16; 18_000];
    // Uneven chunks, crossing tick and step boundaries.
    let (a, rest) = parts.split_at_mut(6_000);
    let (b, c) = rest.split_at_mut(7_000);
    chunked.render(a);
    chunked.render(b);
    chunked.render(c);

    assert_eq!(whole, parts);
}

#[test]
fn paused_render_is_silent_and_resumes_in_phase() {
    let song = Song::from_bytes(&demo_module()).expect("valid module");
    let waves = WaveBank::build();

    let mut paused = Player::new(&song, &waves, 48_000);
    paused.play(0);
    let mut reference = Player::new(&song, &waves, 48_000);
    reference.play(0);

    let mut buf_a = vec![0i16; 8000];
    let mut buf_b = vec![0i16; 8000];
    paused.render(&mut buf_a);
    reference.render(&mut buf_b);
    assert_eq!(buf_a, buf_b);

    // Pause writes pure silence without advancing the tick clock.
    paused.set_pause(true);
    let mut silence = vec![1i16; 2000];
    paused.render(&mut silence);
    assert!(silence.iter().all(|&s| s == 0));

    paused.set_pause(false);
    paused.render(&mut buf_a);
    reference.render(&mut buf_b);
    assert_eq!(buf_a, buf_b, "unpausing must resume phase-coherently");
}

#[test]
fn loop_budget_finishes_a_bounded_render() {
    let song = Song::from_bytes(&demo_module()).expect("valid module");
    let waves = WaveBank::build();
    let mut player = Player::new(&song, &waves, 48_000);
    player.play(0);
    player.set_loop_times(0); // stop at the first wrap

    let mut chunk = vec![0i16; 8192];
    let mut chunks = 0;
    while !player.finished() {
        player.render(&mut chunk);
        chunks += 1;
        assert!(chunks < 64, "song never reported finished");
    }

    assert!(player.loop_counter() == 0);
    assert!(player.finished());
}
