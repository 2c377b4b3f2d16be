#![cfg_attr(docsrs, feature(doc_cfg))]
//#![warn(missing_docs)]

/*!
 <div align="center">
   <h1>Spring-Batch engine for Rust</h1>
   <h3>Restartable chunk-oriented batch processing</h3>

   ![license](https://shields.io/badge/license-MIT%2FApache--2.0-blue)

  </div>

 # Spring-Batch engine for Rust

 A batch engine in the spirit of Java Spring Batch. Items are read, processed
 and written in chunks, each chunk committed in its own transaction together
 with the step counters and the state of the readers. A job that dies at any
 point restarts right after the last committed chunk.

 ## Core Concepts

- **Job:** An ordered sequence of `Step`s, launched with identifying `JobParameters`.
  A job name plus its parameters identify a `JobInstance`; every launch of an
  instance is a `JobExecution`.
- **Step:** A chunk-oriented phase of a job, driven by an `ItemReader`, an
  `ItemProcessor` and an `ItemWriter`. Every run of a step is a `StepExecution`.
- **ExecutionContext:** Key/value state persisted at each commit. Readers and
  writers store their position there and find it back on restart.
- **JobRepository:** Persists executions with optimistic versioning. It refuses
  a second concurrent execution of the same instance and a relaunch of a
  completed one.
- **RetryPolicy / SkipPolicy:** Decide, per error kind, whether a failed
  operation is attempted again or the item is skipped.

 ## Fault tolerance

 A failed read or process call is retried in place, then skipped when the
 skip policy allows it. A failed chunk write is retried as a batch; once
 retries are exhausted the chunk is scanned: items are written one by one in
 a fresh transaction to find which one fails, and only that one is skipped.

 ## Features

| **Feature**   | **Description**                                               |
|---------------|---------------------------------------------------------------|
| rdbc-sqlite   | Enables a `JobRepository` persisting executions in SQLite     |
| logger        | Enables a logger `ItemWriter`, useful for debugging purposes  |
| full          | Enables all available features                                |

 ## Getting Started

```rust
# use spring_batch_engine::{
#     core::{
#         item::{ItemProcessor, ItemProcessorResult},
#         job::{Job, JobBuilder},
#         execution::{BatchStatus, JobParameters},
#         step::StepBuilder,
#     },
#     error::BatchError,
#     item::list::{ListItemReader, ListItemWriter},
#     repository::InMemoryJobRepository,
# };
struct ParseProcessor;

impl ItemProcessor<String, u32> for ParseProcessor {
    fn process(&self, item: &String) -> ItemProcessorResult<u32> {
        item.trim()
            .parse()
            .map(Some)
            .map_err(|error| BatchError::processor("parse.InvalidNumber", format!("{}", error)))
    }
}

fn main() -> Result<(), BatchError> {
    let lines = vec!["1", "2", "three", "4"]
        .into_iter()
        .map(String::from)
        .collect::<Vec<String>>();

    let reader = ListItemReader::new("lines", lines);
    let writer = ListItemWriter::<u32>::new();
    let repository = InMemoryJobRepository::new();

    let step = StepBuilder::new()
        .name("parse".to_string())
        .reader(&reader)
        .processor(&ParseProcessor)
        .writer(&writer)
        .chunk(2) // set commit interval
        .skip("parse.*") // set fault tolerance
        .skip_limit(1)
        .build()?;

    let job = JobBuilder::new().name("numbers".to_string()).start(&step).build();
    let execution = job.run(&repository, &JobParameters::new().with_string("file", "lines.txt"))?;

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(writer.items(), vec![1, 2, 4]);
    assert_eq!(execution.step_executions[0].process_skip_count, 1);

    Ok(())
}
```

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.

 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Set of items readers / writers
pub mod item;

/// Persistence of job and step executions
pub mod repository;
