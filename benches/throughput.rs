use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::thread;
use std::time::Duration;
use window_pipeline::{MeanStage, MovingAverageStage, PassthroughStage, PipelineBuilder};

const WINDOWS: usize = 1000;
const WINDOW_SIZE: usize = 64;

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    c.bench_function("single_stage_1000_windows", |b| {
        b.iter(|| {
            let mut builder = PipelineBuilder::new();
            let samples = builder.source("samples", WINDOW_SIZE).expect("Build failed");
            let copy = builder
                .add_stage(samples, PassthroughStage::new(WINDOW_SIZE))
                .expect("Build failed");
            let mut sink = builder.add_sink(copy, "out").expect("Build failed");

            let mut running = builder.build().expect("Build failed").start().expect("Start failed");
            let mut source = running.take_source(samples).expect("Source missing");
            let producer = thread::spawn(move || {
                let window: Vec<f32> = vec![0.5; WINDOW_SIZE];
                for _ in 0..WINDOWS {
                    source.write_window(black_box(&window)).expect("Write failed");
                }
            });

            let windows = sink.collect_windows(None).expect("Read failed");
            producer.join().expect("Producer panicked");
            running.wait().expect("Wait failed");
            black_box(windows.len())
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    c.bench_function("mean_smooth_chain_1000_windows", |b| {
        b.iter(|| {
            let mut builder = PipelineBuilder::new();
            let samples = builder.source("samples", WINDOW_SIZE).expect("Build failed");
            let copy = builder
                .add_stage(samples, PassthroughStage::new(WINDOW_SIZE))
                .expect("Build failed");
            let mean = builder
                .add_stage(copy, MeanStage::new(WINDOW_SIZE))
                .expect("Build failed");
            let smooth = builder
                .add_stage(mean, MovingAverageStage::new(1, 8))
                .expect("Build failed");
            let mut sink = builder.add_sink(smooth, "out").expect("Build failed");

            let mut running = builder.build().expect("Build failed").start().expect("Start failed");
            let mut source = running.take_source(samples).expect("Source missing");
            let producer = thread::spawn(move || {
                for i in 0..WINDOWS {
                    let window = vec![i as f32; WINDOW_SIZE];
                    source.write_window(black_box(&window)).expect("Write failed");
                }
            });

            let windows = sink.collect_windows(None).expect("Read failed");
            producer.join().expect("Producer panicked");
            running.wait().expect("Wait failed");
            black_box(windows.len())
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput
);
criterion_main!(benches);
