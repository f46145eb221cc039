use std::future::Future;

use hf_hub::api::tokio::Api;

use crate::{config::PipelineConfig, ImageModel, ModelSource, Result};

pub trait Loader {
    type Model: ImageModel;
    type Variant;

    fn load(
        variant: Self::Variant,
        source: ModelSource,
        api: Api,
        config: &PipelineConfig,
    ) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}
