//! Daemon assembly: build the core from configuration, mount the FUSE
//! gateway, and tear everything down in order on exit.

use std::sync::Arc;

use tokio::select;
use tracing::{debug, error, info};

use aggfs::dispatcher::Dispatcher;
use aggfs::fuse::{FuseGateway, InProcessClient};
use aggfs::handle::HandleManager;
use aggfs::mount::MountTable;
use aggfs::plugin::Plugin;
use aggfs::session::Session;
use aggfs::symlink::SymlinkStore;

use crate::app_config::Config;

mod managed_fuse {
    //! fuser will not force-unmount the filesystem when the
    //! `BackgroundSession` is dropped, only a regular unmount; we want to
    //! be aggressive and force an unmount if possible.
    use std::path::PathBuf;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{debug, error};

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: PathBuf) -> Self {
            Self { mount_point }
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "confirming unmount of FUSE filesystem");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!("unmounted FUSE filesystem on attempt {}", i + 1);
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!("FUSE filesystem still busy on attempt {}, retrying", i + 1);
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!("failed to unmount FUSE filesystem on attempt {}: {}", i + 1, e);
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents).
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "mount point '{}' already exists and is not empty",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "created mount point directory");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("received Ctrl+C, shutting down");
        },
        _ = sigterm.recv() => {
            debug!("received termination signal, shutting down");
        },
        _ = sighup.recv() => {
            debug!("received hangup signal, shutting down");
        },
    }
    Ok(())
}

/// Build the dispatcher and its collaborators from configuration.
///
/// Returns the dispatcher plus the plugin instances, which the caller
/// shuts down after unmounting.
fn build_core(
    config: &Config,
) -> Result<(Arc<Dispatcher>, Vec<Arc<dyn Plugin>>), std::io::Error> {
    let mounts = Arc::new(MountTable::new());
    let symlinks = Arc::new(SymlinkStore::new());
    let handles = HandleManager::new(config.handles.to_handle_config());

    let mut plugins = Vec::with_capacity(config.mounts.len());
    for mount in &config.mounts {
        let plugin =
            aggfs::plugins::build(&mount.plugin, mount.instance_name(), &mount.config)
                .map_err(std::io::Error::other)?;
        mounts
            .mount(&mount.path, Arc::clone(&plugin), mount.config.clone())
            .map_err(std::io::Error::other)?;
        info!(path = %mount.path, plugin = %mount.plugin, "mounted");
        plugins.push(plugin);
    }

    for link in &config.symlinks {
        symlinks
            .create(&link.source, &link.target)
            .map_err(std::io::Error::other)?;
        debug!(source = %link.source, target = %link.target, "seeded symlink");
    }

    Ok((
        Arc::new(Dispatcher::new(mounts, symlinks, handles)),
        plugins,
    ))
}

/// Main entry point for the daemon.
pub async fn run(
    config: Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    prepare_mount_point(&config.mount_point).await?;

    let (dispatcher, plugins) = build_core(&config)?;
    let client = Arc::new(InProcessClient::new(Arc::clone(&dispatcher), Session::new()));
    let gateway = FuseGateway::new(client, handle, (config.uid, config.gid));

    let mount_opts = [
        fuser::MountOption::FSName("aggfs".to_owned()),
        fuser::MountOption::RW,
        fuser::MountOption::NoDev,
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];

    info!("mounting filesystem at {}", config.mount_point.display());
    let unmount_guard = managed_fuse::ManagedFuse::new(config.mount_point.clone());
    {
        let _session = fuser::spawn_mount2(gateway, &config.mount_point, &mount_opts)?;
        info!("aggfs is running, press Ctrl+C to stop");
        wait_for_exit().await?;
    }
    drop(unmount_guard);

    dispatcher.handles().stop().await;
    for plugin in plugins {
        plugin.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Run the daemon on a fresh multi-thread runtime.
pub fn spawn(config: Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();
    runtime.block_on(run(config, handle))
}
