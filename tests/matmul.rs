use cntryl_probe::{
    matmul, multiply_reference, parallel_multiply, BlockLayout, Delta, Matrix, ProbeConfig,
    ProbeKind, ProbeRunner, SchedulingPass, Timer,
};
use proptest::prelude::*;

#[test]
fn should_match_reference_for_every_thread_count_up_to_64() {
    let layout = BlockLayout::new(4, 8).unwrap();
    let a = Matrix::seeded(layout.dim(), 7);
    let b = Matrix::seeded(layout.dim(), 8);
    let expected = multiply_reference(&a, &b).unwrap();

    let mut pass = SchedulingPass::new(layout, &a, &b).unwrap();
    for threads in 1..=64 {
        pass.run(threads).unwrap();
        pass.verify(&expected)
            .unwrap_or_else(|e| panic!("{threads} threads: {e}"));
    }
}

#[test]
fn should_match_reference_with_default_shape_and_ten_workers() {
    let a = Matrix::seeded(64, 1);
    let b = Matrix::seeded(64, 2);
    let c = parallel_multiply(&a, &b, 16, 10).unwrap();
    assert_eq!(c, multiply_reference(&a, &b).unwrap());
}

#[test]
fn should_handle_one_block_with_more_workers_than_blocks() {
    let a = Matrix::seeded(16, 3);
    let b = Matrix::seeded(16, 4);
    let c = parallel_multiply(&a, &b, 16, 4).unwrap();
    assert_eq!(c, multiply_reference(&a, &b).unwrap());
}

#[test]
fn should_leave_identical_result_after_repeated_timed_passes() {
    let layout = BlockLayout::new(2, 8).unwrap();
    let a = Matrix::seeded(layout.dim(), 11);
    let b = Matrix::seeded(layout.dim(), 12);
    let expected = multiply_reference(&a, &b).unwrap();

    let timer = Timer::with_delta(Delta::from_secs(1e-6).unwrap());
    let mut pass = SchedulingPass::new(layout, &a, &b).unwrap();
    let timing = matmul::time_pass(&timer, &mut pass, 3, 0.1).unwrap();

    assert!(timing.iterations >= 1);
    pass.verify(&expected).unwrap();
}

#[test]
fn should_record_verified_matmul_row_on_runner() {
    let config = ProbeConfig::new().tolerance(0.1).verbose(false);
    let mut runner = ProbeRunner::new("it", config).unwrap();
    let layout = BlockLayout::new(2, 4).unwrap();

    let row = matmul::probe(&mut runner, layout, 4, 99, true).unwrap();

    assert_eq!(row.name, "it/matmul[t=4]");
    assert_eq!(row.kind, ProbeKind::Matmul);
    assert_eq!(row.work_units, Some(512));
    assert_eq!(row.tags.get("dim").map(String::as_str), Some("8"));
    assert!(row.iterations >= 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_parallel_product_matches_reference(
        seed in any::<u64>(),
        grid in 1usize..5,
        block in 1usize..9,
        threads in 1usize..17,
    ) {
        let dim = grid * block;
        let a = Matrix::seeded(dim, seed);
        let b = Matrix::seeded(dim, seed.wrapping_add(1));
        let c = parallel_multiply(&a, &b, block, threads).unwrap();
        prop_assert_eq!(c, multiply_reference(&a, &b).unwrap());
    }
}
