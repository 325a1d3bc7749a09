//! Feature extraction chain over a synthetic signal
//!
//! Generates a two-tone signal, computes per-window band energies, then
//! splits into a loudness branch and a smoothed-energy branch that read the
//! same buffer at different paces.
//!
//! Usage: RUST_LOG=debug cargo run --example feature_chain --release

use std::f32::consts::PI;
use std::thread;
use window_pipeline::{
    MapStage, MeanStage, MovingAverageStage, PipelineBuilder, PipelineConfig,
    Result as PipelineResult, Sample,
};

const WINDOW: usize = 256;
const BANDS: usize = 8;
const SAMPLE_RATE: f32 = 8000.0;

/// Energy in `BANDS` equal-width frequency bands via a direct DFT
fn band_energies(window: &[Sample]) -> PipelineResult<Vec<Sample>> {
    let bins = window.len() / 2;
    let per_band = (bins / BANDS).max(1);
    let mut energies = vec![0.0; BANDS];
    for k in 0..bins {
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (n, x) in window.iter().enumerate() {
            let phase = 2.0 * PI * (k * n) as f32 / window.len() as f32;
            re += x * phase.cos();
            im -= x * phase.sin();
        }
        energies[(k / per_band).min(BANDS - 1)] += re * re + im * im;
    }
    Ok(energies)
}

fn main() -> PipelineResult<()> {
    env_logger::init();

    let config = PipelineConfig::default().with_buffer_depth(4);
    let mut builder = PipelineBuilder::with_config(config);
    let samples = builder.source("samples", WINDOW)?;
    let bands = builder.add_stage(samples, MapStage::new("bands", WINDOW, BANDS, band_energies))?;
    let loudness = builder.add_stage(bands, MeanStage::new(BANDS))?;
    let smooth = builder.add_stage(bands, MovingAverageStage::new(BANDS, 4))?;
    let mut loudness_out = builder.add_sink(loudness, "loudness")?;
    let mut smooth_out = builder.add_sink(smooth, "smooth")?;

    let pipeline = builder.build()?;
    println!("Smoothed output lags input by {:?} windows", pipeline.window_offset(smooth));
    let mut running = pipeline.start()?;

    let mut source = running.take_source(samples).expect("source registered above");
    let producer = thread::spawn(move || -> PipelineResult<()> {
        let total = WINDOW * 64;
        let signal: Vec<Sample> = (0..total)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE;
                (2.0 * PI * 440.0 * t).sin() + 0.5 * (2.0 * PI * 1800.0 * t).sin()
            })
            .collect();
        let leftover = source.write_samples(&signal)?;
        println!("Source wrote {} windows, {} samples left over", total / WINDOW, leftover);
        source.finish();
        Ok(())
    });

    let loudness_reader = thread::spawn(move || loudness_out.collect_windows(None));
    while let Some(window) = smooth_out.read_window(None)? {
        let peak = window
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (i, &e)| if e > best.1 { (i, e) } else { best });
        println!("smoothed peak band {} energy {:.1}", peak.0, peak.1);
    }

    let loudness = loudness_reader.join().expect("loudness reader panicked")?;
    println!("{} loudness windows", loudness.len());
    producer.join().expect("producer panicked")?;
    println!("{}", running.metrics_summary());
    running.wait()
}
