use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, Result};
use crate::types::{NostrEvent, KIND_COMMENT, KIND_REACTION};

/// 公開コメント（kind 1111）
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub event_id: String,
    pub author: String,
    pub created_at: i64,
    pub content: String,
    pub parent: Option<String>,
}

/// コメントスレッドの節
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

/// コメントイベントのデコード。rootタグが出品を指さないものは対象外
pub fn decode_comment(event: &NostrEvent, root_id: &str) -> Result<Comment> {
    if event.kind != KIND_COMMENT {
        return Err(CoreError::ParseError(format!(
            "kind {} is not a comment",
            event.kind
        )));
    }
    if event.content.trim().is_empty() {
        return Err(CoreError::ParseError("comment has no content".to_string()));
    }
    if !event.tag_values("e").iter().any(|v| *v == root_id) {
        return Err(CoreError::ParseError(
            "comment does not reference the listing".to_string(),
        ));
    }

    // replyマーカーが親コメント。無ければ出品直下
    let parent = event
        .e_tag_with_marker("reply")
        .filter(|p| *p != root_id)
        .map(|p| p.to_string());

    Ok(Comment {
        event_id: event.id.clone(),
        author: event.pubkey.clone(),
        created_at: event.created_at,
        content: event.content.clone(),
        parent,
    })
}

/// コメント木を組み立てる
///
/// 親が見つからない返信はトップレベルに落とす。古い順
pub fn build_comment_tree(events: &[NostrEvent], root_id: &str) -> Vec<CommentNode> {
    let mut comments: Vec<Comment> = events
        .iter()
        .filter_map(|event| match decode_comment(event, root_id) {
            Ok(comment) => Some(comment),
            Err(e) => {
                log::debug!("Dropping malformed comment {}: {}", event.id, e);
                None
            }
        })
        .collect();
    comments.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let known: HashSet<String> = comments.iter().map(|c| c.event_id.clone()).collect();
    let mut children: HashMap<String, Vec<Comment>> = HashMap::new();
    let mut roots: Vec<Comment> = Vec::new();

    for comment in comments {
        match &comment.parent {
            Some(parent) if known.contains(parent) => {
                children.entry(parent.clone()).or_default().push(comment);
            }
            _ => roots.push(comment),
        }
    }

    roots
        .into_iter()
        .map(|comment| attach_replies(comment, &mut children))
        .collect()
}

fn attach_replies(comment: Comment, children: &mut HashMap<String, Vec<Comment>>) -> CommentNode {
    let replies = children
        .remove(&comment.event_id)
        .unwrap_or_default()
        .into_iter()
        .map(|reply| attach_replies(reply, children))
        .collect();
    CommentNode { comment, replies }
}

/// リアクション数（"+"のみ、1公開鍵1票）
pub fn count_reactions(events: &[NostrEvent], root_id: &str) -> usize {
    let mut voters = HashSet::new();
    for event in events {
        if event.kind != KIND_REACTION {
            continue;
        }
        if !event.tag_values("e").iter().any(|v| *v == root_id) {
            continue;
        }
        if event.content != "+" && !event.content.is_empty() {
            continue;
        }
        voters.insert(event.pubkey.clone());
    }
    voters.len()
}
