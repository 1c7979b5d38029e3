use std::sync::Arc;

use lanebus::engine::{Engine, ProtocolBinding};
use lanebus::hil::HilPlatform;
use lanebus::pal::{HostPlatform, Platform};
use lanebus::protocol::j1939::{DecodeMap, EncodeMap, J1939Driver};
use lanebus::stages::cyclic::{CyclicOutputConfig, OutputKind};
use lanebus::stages::gpio_pattern::GpioPatternConfig;
use lanebus::stages::merge::{MergeConfig, MergeMethod};
use lanebus::stages::remap::RemapConfig;
use lanebus::stages::scale::ScaleConfig;

// Demo wiring: two redundant "ADC" channels vote into a scaled engine load
// signal that is broadcast as EEC1-style torque and mirrored on a status
// LED. Set LANEBUS_TWIN=host:port to attach a HIL twin.
fn main() {
    env_logger::init();

    let platform = Arc::new(HilPlatform::new(HostPlatform::new()));
    if let Ok(addr) = std::env::var("LANEBUS_TWIN") {
        match platform.connect(&addr) {
            Ok(()) => log::info!("twin attached at {addr}"),
            Err(e) => log::warn!("twin unavailable ({e}), running standalone"),
        }
    }

    let mut engine = Engine::new(platform.clone());

    // Raw channels 0/1 -> deadzoned remaps -> voter -> percent scale.
    let mut r0 = RemapConfig::new(0, 2);
    r0.deadzone = 8;
    let mut r1 = RemapConfig::new(1, 3);
    r1.deadzone = 8;
    engine.registry_mut().add_remap(r0).unwrap();
    engine.registry_mut().add_remap(r1).unwrap();

    let mut vote = MergeConfig::new(&[2, 3], 4, MergeMethod::Median);
    vote.tolerance = 64;
    engine.add_merge(vote).unwrap();

    // 12-bit ADC counts to 0..=250 "torque raw" units.
    let mut load = ScaleConfig::new(4, 5, 61, 0);
    load.clamp_min = Some(0);
    load.clamp_max = Some(250);
    engine.registry_mut().add_scale(load).unwrap();

    // Broadcast the load via the J1939 cache every 100 ms.
    let mut driver = J1939Driver::new(0x25);
    driver.add_decode_map(DecodeMap::et1(8)).unwrap();
    driver
        .add_encode_map(EncodeMap::new(
            lanebus::protocol::j1939::PGN_EEC1,
            6,
            100,
            &DecodeMap::eec1(5, 6).fields,
        ))
        .unwrap();
    engine
        .add_protocol(ProtocolBinding::J1939 { bus: 0, driver })
        .unwrap();
    engine
        .add_cyclic_output(CyclicOutputConfig::new(5, OutputKind::J1939, 5, 100_000))
        .unwrap();

    // Heartbeat LED, gated on the voted signal being nonzero.
    let mut led = GpioPatternConfig::blink(13, 500_000);
    led.control_signal = Some(4);
    engine.add_gpio_pattern(led).unwrap();

    engine.seal();
    let ring = engine.ring();

    for tick in 0u32..200 {
        // Synthetic ADC ramp with a little channel disagreement.
        let base = (tick % 100) * 40;
        ring.push(0, base, platform.now_us());
        ring.push(1, base + 16, platform.now_us());

        for event in platform.poll_twin() {
            match event {
                lanebus::hil::TwinEvent::Sample { source, value } => {
                    ring.push(source, value, platform.now_us());
                }
            }
        }

        engine.poll_can();
        let summary = engine.step(platform.now_us());
        if tick % 20 == 0 {
            log::info!(
                "tick {tick}: load={:?} outputs={} frames={}",
                engine.table().value(5),
                summary.outputs_emitted,
                summary.frames_sent
            );
        }
        platform.sleep_ms(10);
    }

    let tx = platform.inner().take_can_tx(0);
    println!(
        "done: load signal = {:?}, {} frames on can0",
        engine.table().value(5),
        tx.len()
    );
}
