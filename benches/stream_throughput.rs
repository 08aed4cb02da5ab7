//! Stream throughput benchmark suite.
//!
//! Measures byte throughput of a connection pair joined by an in-memory
//! pipe, at different write sizes and reader buffer sizes:
//! - Write sizes: 64 B, 4 KiB, 64 KiB
//! - Read buffers: 1 KiB, 32 KiB
//!
//! Run with: cargo bench --bench stream_throughput
//! Results saved to: target/criterion/

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::io::duplex;
use tokio::runtime::Runtime;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use ws_stream_transport::StreamConn;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const WRITE_SIZES: &[usize] = &[64, 4 * 1024, 64 * 1024];
const READ_BUFFERS: &[usize] = &[1024, 32 * 1024];

/// Bytes moved per iteration.
const TOTAL_BYTES: usize = 1024 * 1024;

/// Buffer size of the in-memory pipe.
const PIPE_SIZE: usize = 256 * 1024;

// ============================================================================
// Benchmark: Write Then Read
// ============================================================================

fn bench_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("stream_throughput");
    group.throughput(Throughput::Bytes(TOTAL_BYTES as u64));
    group.sample_size(20);

    for &write_size in WRITE_SIZES {
        for &read_buffer in READ_BUFFERS {
            let id = format!("w{write_size}_r{read_buffer}");
            group.bench_with_input(
                BenchmarkId::new("transfer", &id),
                &(write_size, read_buffer),
                |b, &(write_size, read_buffer)| {
                    b.to_async(&rt)
                        .iter(|| async move { transfer(write_size, read_buffer).await });
                },
            );
        }
    }

    group.finish();
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn pair() -> (StreamConn, StreamConn) {
    let (a, b) = duplex(PIPE_SIZE);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (
        StreamConn::from_tungstenite(client, None),
        StreamConn::from_tungstenite(server, None),
    )
}

async fn transfer(write_size: usize, read_buffer: usize) -> usize {
    let (client, server) = pair().await;
    let chunk = vec![0xa5u8; write_size];

    let writer = tokio::spawn(async move {
        let mut sent = 0;
        while sent < TOTAL_BYTES {
            sent += client.write(&chunk).await.unwrap();
        }
        client.close().await.unwrap();
    });

    let mut buf = vec![0u8; read_buffer];
    let mut received = 0;
    loop {
        let n = server.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received += n;
    }

    writer.await.unwrap();
    received
}

criterion_group!(benches, bench_throughput);
criterion_main!(benches);
