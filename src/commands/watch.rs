use clap::Args;

use smartmarks_core::{Bookmark, SyncHandle, SyncView};

#[derive(Args)]
pub struct WatchCommand {}

impl WatchCommand {
    pub async fn run(&self, handle: &SyncHandle) -> Result<(), Box<dyn std::error::Error>> {
        let mut views = handle.watch();
        let mut current = views.borrow_and_update().clone();

        if !current.live {
            return Err("Live updates are unavailable; cannot watch".into());
        }

        println!("Watching {} bookmark(s). Press Ctrl-C to stop.", current.bookmarks.len());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = views.borrow_and_update().clone();
                    let (added, removed) = diff(&current, &next);
                    for bookmark in added {
                        println!("+ {} ({})  {}", bookmark.title, bookmark.url, bookmark.id);
                    }
                    for bookmark in removed {
                        println!("- {} ({})  {}", bookmark.title, bookmark.url, bookmark.id);
                    }
                    if next.last_error != current.last_error {
                        if let Some(error) = &next.last_error {
                            eprintln!("Error: {}", error);
                        }
                    }
                    if current.live && !next.live {
                        return Err("Live updates were lost".into());
                    }
                    current = next;
                }
            }
        }

        Ok(())
    }
}

/// Rows present only in `next`, and rows present only in `previous`.
fn diff<'a>(previous: &'a SyncView, next: &'a SyncView) -> (Vec<&'a Bookmark>, Vec<&'a Bookmark>) {
    let added = next
        .bookmarks
        .iter()
        .filter(|b| !previous.contains(&b.id))
        .collect();
    let removed = previous
        .bookmarks
        .iter()
        .filter(|b| !next.contains(&b.id))
        .collect();
    (added, removed)
}
