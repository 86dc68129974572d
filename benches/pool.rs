use std::ffi::c_void;

use criterion::{criterion_group, criterion_main, Criterion};
use ef_runtime::pool::{Coroutine, CoroutinePool};

extern "C" fn noop(_param: *mut c_void) -> i64 {
    0
}

fn create_and_resume(c: &mut Criterion) {
    c.bench_function("create_and_resume_fresh", |b| {
        b.iter_batched(
            || CoroutinePool::new(64 * 1024, 0, 1).unwrap(),
            |mut pool| {
                let co = pool.create(std::mem::size_of::<Coroutine>(), noop, std::ptr::null_mut()).unwrap();
                unsafe { pool.resume(co, 0).unwrap() };
            },
            criterion::BatchSize::SmallInput,
        )
    });

    c.bench_function("create_and_resume_reused", |b| {
        let mut pool = CoroutinePool::new(64 * 1024, 1, 2).unwrap();
        let warm = pool.create(std::mem::size_of::<Coroutine>(), noop, std::ptr::null_mut()).unwrap();
        unsafe { pool.resume(warm, 0).unwrap() };

        b.iter(|| {
            let co = pool.create(std::mem::size_of::<Coroutine>(), noop, std::ptr::null_mut()).unwrap();
            unsafe { pool.resume(co, 0).unwrap() };
        })
    });
}

criterion_group!(benches, create_and_resume);
criterion_main!(benches);
