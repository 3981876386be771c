//! Commands that talk to the analysis service

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docsync_core::{
    diff_texts, Cancellable, Config, ContentAssistParams, DocumentSession, DocumentSource,
    SelectionRange, SharedDocument,
};

use crate::output::Output;
use crate::watcher::FileWatcher;

/// Synchronize a file and print the acknowledged state id
pub async fn sync(config: &Config, file: &Path, output: &Output) -> Result<()> {
    let (_, session) = open(config, file).await?;

    session
        .service()
        .synchronize()
        .await
        .context("Failed to synchronize")?;
    output.print_state(
        session.service().resource(),
        session.service().state_id().as_deref(),
    );

    session.shutdown().await;
    Ok(())
}

/// Format a file, or the `range` of it, and print or write back the result
pub async fn format(
    config: &Config,
    file: &Path,
    range: Option<(usize, usize)>,
    write: bool,
    output: &Output,
) -> Result<()> {
    let (document, session) = open(config, file).await?;

    if let Some((from, to)) = range {
        let len = document.snapshot().len();
        if from > to || to > len {
            bail!(
                "Invalid range {}..{} for a document of {} characters",
                from,
                to,
                len
            );
        }
        document.set_selection(SelectionRange::new(from, to));
    }

    let change = session
        .service()
        .format()
        .await
        .context("Failed to format")?;
    let text = document.text();

    if write {
        std::fs::write(file, &text)
            .with_context(|| format!("Failed to write {}", file.display()))?;
        output.success(&format!("Formatted {}", file.display()));
    } else {
        output.print_formatted(&text, &change);
    }

    session.shutdown().await;
    Ok(())
}

pub async fn hover(config: &Config, file: &Path, offset: usize, output: &Output) -> Result<()> {
    let (document, session) = open(config, file).await?;
    check_offset(&document, offset)?;

    let result = session
        .service()
        .hover(offset)
        .await
        .context("Failed to get hover information")?;
    output.print_hover(&result);

    session.shutdown().await;
    Ok(())
}

pub async fn occurrences(
    config: &Config,
    file: &Path,
    offset: usize,
    output: &Output,
) -> Result<()> {
    let (document, session) = open(config, file).await?;
    check_offset(&document, offset)?;

    let result = session
        .service()
        .occurrences(|| Cancellable::Completed(offset))
        .await
        .context("Failed to find occurrences")?;
    output.print_occurrences(&result);

    session.shutdown().await;
    Ok(())
}

/// Print completion proposals; Ctrl-C cancels the request
pub async fn assist(
    config: &Config,
    file: &Path,
    offset: usize,
    limit: usize,
    output: &Output,
) -> Result<()> {
    let (document, session) = open(config, file).await?;
    check_offset(&document, offset)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let params = ContentAssistParams {
        caret_offset: offset,
        proposals_limit: limit,
    };
    let result = session.service().content_assist(params, &cancel).await;
    interrupt.abort();

    let entries = result.context("Failed to get proposals")?;
    output.print_proposals(&entries);

    session.shutdown().await;
    Ok(())
}

/// Keep `file` synchronized until interrupted
///
/// Each change the file system reports becomes one edit.
pub async fn watch(config: &Config, file: &Path, output: &Output) -> Result<()> {
    let endpoint = endpoint(config)?;
    let mut last_text = read_text(file)?;
    let mut watcher = FileWatcher::new(file)?;
    let document = Arc::new(SharedDocument::new(&last_text));
    let session = DocumentSession::new(config, document.clone());
    let mut events = session
        .take_events()
        .context("Session events already taken")?;
    let mut status = session.connection().subscribe_status();

    session.connect(endpoint);
    output.message(&format!("Watching {} (Ctrl-C to stop)", file.display()));

    let mut last_phase = status.borrow().phase;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = watcher.recv() => {
                if changed.is_none() {
                    break;
                }
                watcher.settle().await;
                let text = match read_text(file) {
                    Ok(text) => text,
                    Err(e) => {
                        // Editors may replace the file while saving
                        debug!("Skipping change: {:#}", e);
                        continue;
                    }
                };
                if let Some(change) = diff_texts(&last_text, &text) {
                    debug!(
                        "File changed at {} (-{} +{})",
                        change.offset,
                        change.removed_len,
                        change.inserted_len()
                    );
                    session.edit(&change).context("Failed to apply file change")?;
                    last_text = text;
                }
            }
            event = events.recv() => match event {
                Some(event) => output.print_session_event(&event),
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.phase != last_phase {
                    last_phase = current.phase;
                    output.print_status(&current);
                }
            }
        }
    }

    if session.is_ready() {
        if let Err(e) = session.service().synchronize().await {
            warn!("Final synchronization failed: {}", e);
        }
    }
    info!("Stopped watching {}", file.display());
    session.shutdown().await;
    Ok(())
}

/// Read `file`, connect and wait until the server has its full text
async fn open(config: &Config, file: &Path) -> Result<(Arc<SharedDocument>, DocumentSession)> {
    let endpoint = endpoint(config)?;
    let text = read_text(file)?;
    let document = Arc::new(SharedDocument::new(&text));
    let session = DocumentSession::new(config, document.clone());

    session.connect(endpoint);
    let wait = config.connection.open_timeout() + config.sync.request_timeout();
    if let Err(e) = session.wait_until_ready(wait).await {
        let errors = session.connection().recent_errors();
        session.shutdown().await;
        return match errors.last() {
            Some(last) => {
                Err(e).with_context(|| format!("Could not connect to {}: {}", endpoint, last))
            }
            None => Err(e).with_context(|| format!("Could not connect to {}", endpoint)),
        };
    }

    Ok((document, session))
}

fn endpoint(config: &Config) -> Result<&str> {
    config
        .endpoint
        .as_deref()
        .context("No analysis service endpoint configured")
}

fn read_text(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn check_offset(document: &SharedDocument, offset: usize) -> Result<()> {
    let len = document.snapshot().len();
    if offset > len {
        bail!(
            "Offset {} is past the end of the document ({} characters)",
            offset,
            len
        );
    }
    Ok(())
}
