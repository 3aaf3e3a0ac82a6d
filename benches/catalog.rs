//! Catalog benchmarks
//!
//! Cost of validating and expanding the full Lambda matrix
//! (6 languages x 14 operations x 2 start types x 6 memory sizes x 2 archs),
//! and of deriving test cases lazily from it.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cryptobench_runner::artifacts::LambdaEndpoint;
use cryptobench_runner::catalog::{Architecture, Catalog, Dimensions, EnvDimension, Inputs, StartType};
use cryptobench_runner::payload::{Family, Language, Operation, OperationKind, OperationPayload};
use cryptobench_runner::resolve::LambdaResolver;

const MEMORY_SIZES: [u32; 6] = [128, 256, 512, 1024, 1536, 2048];
const ARCHS: [Architecture; 2] = [Architecture::X86, Architecture::Arm];

fn inputs() -> Inputs {
    Operation::ALL
        .into_iter()
        .map(|op| {
            let raw = match (op.kind(), op.family()) {
                (OperationKind::Verify, _) => r#"{"message":"m","signature":"s"}"#,
                (OperationKind::Decrypt, Family::Aes) => {
                    r#"{"encrypted_data_key":"k","iv":"i","tag":"t","encrypted_message":"c"}"#
                }
                (OperationKind::Decrypt, _) => r#"{"encrypted_aes_key":"k","iv":"i","ciphertext":"c"}"#,
                _ => r#"{"message":"m"}"#,
            };
            (op, OperationPayload::parse(op, raw).expect("valid payload"))
        })
        .collect()
}

fn resolver() -> LambdaResolver {
    let mut endpoints = Vec::new();
    for language in Language::ALL {
        for operation in Operation::ALL {
            for memory_size in MEMORY_SIZES {
                for architecture in ARCHS {
                    endpoints.push(LambdaEndpoint {
                        architecture,
                        language,
                        operation,
                        memory_size,
                        api_url: format!(
                            "https://api.example/{architecture}/{language}/{operation}/{memory_size}"
                        ),
                    });
                }
            }
        }
    }
    LambdaResolver::new(endpoints)
}

fn dims() -> Dimensions {
    Dimensions {
        languages: Language::ALL.to_vec(),
        operations: Operation::ALL.to_vec(),
        start_types: vec![StartType::Cold, StartType::Warm],
        environments: MEMORY_SIZES.into_iter().map(EnvDimension::MemoryMb).collect(),
        architectures: ARCHS.to_vec(),
    }
}

fn bench_catalog(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog");
    let inputs = inputs();
    let resolver = resolver();

    group.bench_function("build_lambda_matrix", |bencher| {
        bencher.iter(|| {
            Catalog::build(dims(), 50, black_box(7), &inputs, None, &resolver)
                .expect("complete matrix")
        })
    });

    let catalog = Catalog::build(dims(), 50, 7, &inputs, None, &resolver).expect("complete matrix");
    group.bench_function("iterate_lambda_matrix", |bencher| {
        bencher.iter(|| black_box(&catalog).iter().map(|case| case.id.len()).sum::<usize>())
    });

    group.finish();
}

criterion_group!(benches, bench_catalog);
criterion_main!(benches);
