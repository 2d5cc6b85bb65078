mod bookmark;

pub use bookmark::{Bookmark, BookmarkCandidate, NewBookmark};
