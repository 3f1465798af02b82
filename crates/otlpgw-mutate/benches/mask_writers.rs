use criterion::{BenchmarkId, Criterion, Throughput, black_box};
use otlpgw_mutate::{InplaceMaskOp, LaneMaskWriter, MaskWriter, ScalarMaskWriter};
use std::{env, sync::Arc, time::Duration};

/// 标量与分道掩码写入器的吞吐对比。
///
/// # 设计背景（Why）
/// - 原地掩码是策略规划器最常见的输出，单个报文可能有数十个掩码区间；
/// - 分道实现只在区间不短于一道（32 字节）时生效，这里覆盖阈值两侧的长度。
fn bench_writers(c: &mut Criterion) {
    let writers: [(&str, &dyn MaskWriter); 2] = [("scalar", &ScalarMaskWriter), ("lanes", &LaneMaskWriter)];
    let mut group = c.benchmark_group("mask_fill");
    for length in [16u32, 64, 512, 4096] {
        group.throughput(Throughput::Bytes(u64::from(length)));
        let op = InplaceMaskOp::new(8, length, b'*');
        for (name, writer) in writers {
            let mut buffer = vec![0u8; length as usize + 16];
            group.bench_with_input(BenchmarkId::new(name, length), &op, |b, op| {
                b.iter(|| {
                    writer.mask(black_box(&mut buffer), op).unwrap_or(());
                    black_box(buffer[8])
                });
            });
        }
    }
    group.finish();

    let mut group = c.benchmark_group("mask_token_copy");
    for length in [64u32, 4096] {
        group.throughput(Throughput::Bytes(u64::from(length)));
        let token: Arc<[u8]> = (0..length).map(|i| i as u8).collect::<Vec<u8>>().into();
        let op = InplaceMaskOp::new(0, length, b'*').with_token(Some(token));
        for (name, writer) in writers {
            let mut buffer = vec![0u8; length as usize];
            group.bench_with_input(BenchmarkId::new(name, length), &op, |b, op| {
                b.iter(|| {
                    writer.mask(black_box(&mut buffer), op).unwrap_or(());
                    black_box(buffer[0])
                });
            });
        }
    }
    group.finish();
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_writers(&mut criterion);
    criterion.final_summary();
}
