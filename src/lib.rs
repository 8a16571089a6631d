// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod macros;
mod pool;
mod task;
mod worker;

pub use pool::{PoolBuilder, PoolMode, ThreadCount, WorkerPool};
pub use task::{Task, TaskError, TaskHandle, TaskOutput};

#[cfg(test)]
mod test {
    use super::*;

    fn init_test_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_sum_of_ranges_end_to_end() {
        init_test_logging();
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(2).unwrap());

        let handles: Vec<_> = (0..5u64)
            .map(|i| {
                let (lo, hi) = (i * 10 + 1, (i + 1) * 10);
                pool.submit(Task::new(move || (lo..=hi).sum::<u64>()))
            })
            .collect();

        let sums: Vec<u64> = handles
            .iter()
            .map(|handle| handle.fetch::<u64>().unwrap())
            .collect();
        assert_eq!(sums, vec![55, 155, 255, 355, 455]);
    }

    #[test]
    fn test_restart_after_shutdown() {
        init_test_logging();
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        let handle = pool.submit(Task::new(|| 1));
        assert_eq!(handle.fetch::<i32>(), Ok(1));
        pool.shutdown();
        assert!(!pool.is_running());

        pool.start(ThreadCount::try_from(2).unwrap());
        assert_eq!(pool.current_threads(), 2);
        let handle = pool.submit(Task::new(|| 2));
        assert_eq!(handle.fetch::<i32>(), Ok(2));
    }

    #[test]
    fn test_available_parallelism_start() {
        init_test_logging();
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::AvailableParallelism);
        assert_eq!(
            pool.current_threads(),
            usize::from(std::thread::available_parallelism().unwrap())
        );
    }
}
