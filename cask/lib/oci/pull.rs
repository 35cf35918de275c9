use futures::future;
use oci_spec::image::ImageConfiguration;

use crate::{
    config::CaskConfig,
    oci::{DockerRegistry, ImageStore, Reference},
    CaskError, CaskResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Pulls an image: resolves its manifests, downloads the layer blobs and
/// materializes each one in the extracted-layer store.
///
/// The whole operation is idempotent — existing blobs are not re-downloaded
/// and existing layer trees are not re-extracted. Blob downloads run
/// concurrently; extraction is keyed (and therefore serialized) per
/// uncompressed digest. Returns the image configuration, whose
/// `rootfs.diff_ids` the rootfs assembler consumes.
pub async fn pull_image(
    config: &CaskConfig,
    reference: &Reference,
) -> CaskResult<ImageConfiguration> {
    tracing::info!(%reference, "pulling image");

    let registry = DockerRegistry::new(config);
    let store = ImageStore::new(config);

    let (manifest, image_config) = registry.resolve(reference).await?;

    let layer_futures: Vec<_> = manifest
        .layers()
        .iter()
        .zip(image_config.rootfs().diff_ids())
        .map(|(descriptor, diff_id)| {
            let registry = &registry;
            let store = &store;
            async move {
                let blob_path = registry.download_blob(reference, descriptor.digest()).await?;
                store.ensure_extracted(&blob_path, Some(diff_id)).await?;
                Ok::<_, CaskError>(())
            }
        })
        .collect();

    for result in future::join_all(layer_futures).await {
        result?;
    }

    tracing::info!(%reference, layers = manifest.layers().len(), "image pulled");
    Ok(image_config)
}
