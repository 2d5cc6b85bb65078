use clap::Args;
use std::io::{self, Write};
use std::time::Duration;

use smartmarks_core::{normalize_url, Bookmark, BookmarkCandidate, SyncHandle, SyncView};

use super::OutputFormat;

/// How long `add` waits for the change feed to deliver the new row.
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct ListCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Only show bookmarks whose domain contains this text
    #[arg(long)]
    pub domain: Option<String>,
}

impl ListCommand {
    pub async fn run(&self, handle: &SyncHandle) -> Result<(), Box<dyn std::error::Error>> {
        let view = handle.settled().await?;

        let bookmarks: Vec<_> = if let Some(domain) = &self.domain {
            let domain_lower = domain.to_lowercase();
            view.bookmarks
                .into_iter()
                .filter(|b| b.domain().to_lowercase().contains(&domain_lower))
                .collect()
        } else {
            view.bookmarks
        };

        if bookmarks.is_empty() {
            println!("No bookmarks found");
            return Ok(());
        }

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&bookmarks)?);
            }
            OutputFormat::Text => print_table(&bookmarks),
        }
        Ok(())
    }
}

fn print_table(bookmarks: &[Bookmark]) {
    println!("{:<36}  {:<30}  {:<24}  ADDED", "ID", "TITLE", "DOMAIN");
    println!("{}", "-".repeat(110));
    for bookmark in bookmarks {
        println!(
            "{:<36}  {:<30}  {:<24}  {}",
            bookmark.id,
            truncate(&bookmark.title, 30),
            truncate(&bookmark.domain(), 24),
            bookmark.created_at.format("%b %-d, %Y")
        );
    }
    println!("\nTotal: {} bookmark(s)", bookmarks.len());
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let head: String = text.chars().take(width - 3).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[derive(Args)]
pub struct AddCommand {
    /// Bookmark title
    pub title: String,

    /// Bookmark URL; https:// is assumed when no scheme is given
    pub url: String,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl AddCommand {
    pub async fn run(&self, handle: &SyncHandle) -> Result<(), Box<dyn std::error::Error>> {
        let before = handle.view();
        let mut views = handle.watch();

        handle
            .add_bookmark(BookmarkCandidate::new(&self.title, &self.url))
            .await?;

        // Validation passed above, so the URL normalizes.
        let url = normalize_url(&self.url)?;
        let added = match tokio::time::timeout(
            ECHO_TIMEOUT,
            views.wait_for(|view| find_new(&before, view, &url).is_some()),
        )
        .await
        {
            Ok(Ok(view)) => find_new(&before, &view, &url).cloned(),
            _ => None,
        };

        match (added, &self.format) {
            (Some(bookmark), OutputFormat::Json) => {
                println!("{}", serde_json::to_string_pretty(&bookmark)?);
            }
            (Some(bookmark), OutputFormat::Text) => {
                println!("Added bookmark:");
                println!("{}", bookmark);
            }
            (None, _) => {
                println!("Added bookmark: {}", url);
                println!("(not yet confirmed by live updates; run 'marks list' to check)");
            }
        }
        Ok(())
    }
}

/// A bookmark with `url` present in `view` but not in `before`.
fn find_new<'a>(before: &SyncView, view: &'a SyncView, url: &str) -> Option<&'a Bookmark> {
    view.bookmarks
        .iter()
        .find(|b| b.url == url && !before.contains(&b.id))
}

#[derive(Args)]
pub struct DeleteCommand {
    /// Bookmark ID
    pub id: String,

    /// Skip confirmation prompt
    #[arg(long, short)]
    pub force: bool,
}

impl DeleteCommand {
    pub async fn run(&self, handle: &SyncHandle) -> Result<(), Box<dyn std::error::Error>> {
        let view = handle.settled().await?;
        let bookmark = match view.bookmarks.iter().find(|b| b.id == self.id) {
            Some(b) => b.clone(),
            None => return Err(format!("Bookmark not found: {}", self.id).into()),
        };

        // Confirm deletion unless --force is used
        if !self.force {
            print!("Delete bookmark '{}'? [y/N] ", bookmark.title);
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Deletion cancelled.");
                return Ok(());
            }
        }

        if let Err(e) = handle.delete_bookmark(&bookmark.id).await {
            // The core resynchronizes after a refused delete.
            let view = handle.settled().await?;
            if view.contains(&bookmark.id) {
                println!("Bookmark '{}' was restored.", bookmark.title);
            }
            return Err(e.into());
        }

        println!("Deleted bookmark: {}", bookmark.title);
        Ok(())
    }
}
