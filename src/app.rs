use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::LevelFilter;
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    config::{Config, FrameLayout},
    context::DocumentContext,
    coordinator::{Coordinator, CoordinatorHandle, DocumentHandle, FrameAddress, FrameId, TabId},
    dom::{Document, NodeId},
    prefs::PreferenceStore,
    shell::{FrameEntry, Shell, ShellCommand},
};

const CONTEXT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[arg(
        short,
        long,
        help = "The path to the config file. The default is `config.toml`."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "The preference file to use. This overrides the value from the config file."
    )]
    pub preferences: Option<PathBuf>,
}

struct BuiltDocument {
    document: Document,
    search_box: NodeId,
    editor: NodeId,
}

fn build_document(layout: &FrameLayout) -> BuiltDocument {
    let mut doc = Document::new();
    let body = doc.body();

    let search_box = doc.create_element("input");
    doc.append_child(body, search_box);
    let editor = doc.create_element("div");
    doc.set_content_editable(editor, true);
    doc.append_child(body, editor);

    let container = if layout.positioned_player {
        let player = doc.create_element("div");
        doc.set_style(player, "position", "relative");
        doc.append_child(body, player);
        player
    } else {
        body
    };
    for media in &layout.media {
        let video = doc.create_video(media.rate, media.paused);
        doc.append_child(container, video);
    }

    BuiltDocument {
        document: doc,
        search_box,
        editor,
    }
}

async fn open_store(config: &Config) -> PreferenceStore {
    let Some(path) = &config.preferences else {
        log::info!("No preference file configured; preferences stay in memory");
        return PreferenceStore::in_memory();
    };
    match PreferenceStore::open(path).await {
        Ok(store) => {
            log::info!("Using preference file {}", path.display());
            store
        }
        Err(err) => {
            log::error!("Failed to open preference file {}: {err:?}", path.display());
            PreferenceStore::in_memory()
        }
    }
}

async fn spawn_frame(
    address: FrameAddress,
    layout: &FrameLayout,
    store: &Arc<PreferenceStore>,
    relay: &CoordinatorHandle,
) -> anyhow::Result<(FrameEntry, JoinHandle<()>)> {
    let BuiltDocument {
        document,
        search_box,
        editor,
    } = build_document(layout);
    let context = DocumentContext::initialize(address, document, store, Some(relay.clone())).await;

    let (message_tx, message_rx) = mpsc::channel(CONTEXT_CHANNEL_CAPACITY);
    relay
        .register(DocumentHandle::new(context.address(), &message_tx))
        .await?;
    let join_handle = tokio::spawn(context.run(message_rx, store.subscribe(), Arc::clone(store)));

    let entry = FrameEntry {
        address,
        message_tx,
        search_box,
        editor,
    };
    Ok((entry, join_handle))
}

async fn run_shell(shell: &Shell) -> anyhow::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match ShellCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("{err}");
                continue;
            }
        };
        match shell.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => log::warn!("{err:#}"),
        }
    }
    Ok(())
}

pub async fn start() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("SPEEDCTL_LOG")
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli_args(&cli)?;

    let store = Arc::new(open_store(&config).await);
    let (relay, coordinator_task) = Coordinator::spawn();

    let tab = TabId::new();
    let mut frames = Vec::new();
    let mut tasks = Vec::new();
    for (index, layout) in config.frames.iter().enumerate() {
        let frame_id = u32::try_from(index)?;
        let address = FrameAddress::new(tab, FrameId(frame_id));
        let (entry, task) = spawn_frame(address, layout, &store, &relay).await?;
        frames.push(entry);
        tasks.push(task);
    }
    log::info!("Tab {tab} is running with {} frame(s)", frames.len());

    let shell = Shell::new(frames, Arc::clone(&store));
    run_shell(&shell).await?;
    shell.shutdown().await;

    for frame in shell.frames() {
        relay.unregister(frame.address).await?;
    }
    drop(shell);
    drop(relay);
    for task in tasks {
        task.await?;
    }
    coordinator_task.await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::MediaLayout;

    use super::*;

    #[test]
    fn should_build_document_from_layout() {
        // given
        let layout = FrameLayout {
            positioned_player: true,
            media: vec![
                MediaLayout {
                    rate: 1.5,
                    paused: false,
                },
                MediaLayout::default(),
            ],
        };

        // when
        let BuiltDocument {
            document: doc,
            search_box,
            editor,
        } = build_document(&layout);

        // then
        let media = doc.query_media();
        assert_eq!(media.len(), 2);
        assert_eq!(doc.playback_rate(media[0]), Some(1.5));
        assert_eq!(doc.is_paused(media[1]), Some(true));
        let player = doc.parent(media[0]).unwrap();
        assert!(doc.position(player).is_positioned());
        assert_eq!(doc.tag(search_box), Some("input"));
        assert!(doc.is_content_editable(editor));
    }

    #[tokio::test]
    async fn should_fall_back_to_memory_when_preference_file_is_invalid() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = Config {
            preferences: Some(path),
            ..Default::default()
        };

        // when
        let store = open_store(&config).await;

        // then
        assert!(store.get().await.is_ok());
    }
}
