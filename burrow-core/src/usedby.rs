//! Computed used-by edges for storage volumes.
//!
//! Nothing stores back-references; consumers are found by forward lookup
//! over instance devices, profile devices and image records, so edges can
//! never dangle.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::types::{Volume, VolumeType};
use std::collections::HashMap;

fn device_references(
    devices: &HashMap<String, HashMap<String, String>>,
    pool_name: &str,
    volume_name: &str,
) -> bool {
    devices.values().any(|cfg| {
        cfg.get("type").map(String::as_str) == Some("disk")
            && cfg.get("pool").map(String::as_str) == Some(pool_name)
            && cfg.get("source").map(String::as_str) == Some(volume_name)
    })
}

/// Compute the used-by URL list for a volume: instance devices, profile
/// devices and (for image volumes) the image record itself.
pub async fn volume_used_by(
    catalog: &Catalog,
    pool_name: &str,
    volume: &Volume,
) -> Result<Vec<String>> {
    let mut used_by = Vec::new();

    for instance in catalog.instances().await? {
        if instance.snapshot {
            continue;
        }

        if instance.project == volume.project
            && (device_references(&instance.devices, pool_name, &volume.name)
                || device_references(&instance.expanded_devices, pool_name, &volume.name))
        {
            used_by.push(format!(
                "/1.0/instances/{}?project={}",
                instance.name, instance.project
            ));
        }
    }

    for profile in catalog.profiles().await? {
        if profile.project == volume.project
            && device_references(&profile.devices, pool_name, &volume.name)
        {
            used_by.push(format!(
                "/1.0/profiles/{}?project={}",
                profile.name, profile.project
            ));
        }
    }

    // An image volume is always consumed by its own image record; callers
    // treat that single self-reference as deletable.
    if volume.volume_type == VolumeType::Image {
        used_by.push(format!("/1.0/images/{}", volume.name));
    }

    used_by.sort();
    Ok(used_by)
}

/// Whether the URL is the image record of the given fingerprint.
#[must_use]
pub fn is_image_url(url: &str, fingerprint: &str) -> bool {
    url == format!("/1.0/images/{}", fingerprint)
}

/// Whether the daemon itself stores its images or backups on this volume.
pub async fn volume_used_by_daemon(
    catalog: &Catalog,
    pool_name: &str,
    volume_name: &str,
) -> Result<bool> {
    let target = format!("{}/{}", pool_name, volume_name);

    for key in ["storage.images_volume", "storage.backups_volume"] {
        if catalog.daemon_config(key).await?.as_deref() == Some(target.as_str()) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Names of instances that reference the volume and are currently running.
pub async fn running_consumers(
    catalog: &Catalog,
    pool_name: &str,
    volume: &Volume,
) -> Result<Vec<String>> {
    let mut running = Vec::new();

    for instance in catalog.instances().await? {
        if instance.snapshot || !instance.running {
            continue;
        }

        if instance.project == volume.project
            && (device_references(&instance.devices, pool_name, &volume.name)
                || device_references(&instance.expanded_devices, pool_name, &volume.name))
        {
            running.push(instance.name);
        }
    }

    Ok(running)
}
