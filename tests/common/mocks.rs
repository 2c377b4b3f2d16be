//! Mock versions of the listener and writer traits.
use mockall::mock;

use spring_batch_engine::{
    BatchError,
    core::{
        context::ExecutionContext,
        item::{ItemStream, ItemWriter, ItemWriterResult},
        listener::SkipListener,
    },
};

mock! {
    pub Writer {}
    impl ItemStream for Writer {
        fn open(&self, context: &ExecutionContext) -> Result<(), BatchError>;
        fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError>;
        fn close(&self) -> Result<(), BatchError>;
    }
    impl ItemWriter<u32> for Writer {
        fn write(&self, items: &[u32]) -> ItemWriterResult;
        fn flush(&self) -> ItemWriterResult;
    }
}

mock! {
    pub SkipRecorder {}
    impl SkipListener<u32, u32> for SkipRecorder {
        fn on_skip_in_read(&self, error: &BatchError) -> Result<(), BatchError>;
        fn on_skip_in_process(&self, item: &u32, error: &BatchError) -> Result<(), BatchError>;
        fn on_skip_in_write(&self, item: &u32, error: &BatchError) -> Result<(), BatchError>;
    }
}
