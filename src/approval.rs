//! Manual confirmation of generated replies before they are posted.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::post::Post;

/// Asked once per reply in manual-approval mode. `false` means do not post.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalGate: Send {
    async fn confirm(&mut self, post: &Post, reply: &str) -> bool;
}

/// Shows the post and reply on a terminal and waits for y/N.
pub struct ConsoleApproval<R, W> {
    input: R,
    output: W,
}

pub type StdinApproval = ConsoleApproval<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdinApproval {
    pub fn stdin() -> Self {
        ConsoleApproval::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ConsoleApproval<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    async fn prompt(&mut self, post: &Post, reply: &str) -> std::io::Result<bool> {
        let rule = "=".repeat(60);
        let text = format!(
            "\n{rule}\nPost by @{}: {}\nReply: {}\n{rule}\nPost this reply? [y/N] ",
            post.author,
            post.preview(100),
            reply,
        );
        self.output.write_all(text.as_bytes()).await?;
        self.output.flush().await?;

        let mut answer = String::new();
        if self.input.read_line(&mut answer).await? == 0 {
            return Ok(false);
        }
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

#[async_trait]
impl<R, W> ApprovalGate for ConsoleApproval<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&mut self, post: &Post, reply: &str) -> bool {
        match self.prompt(post, reply).await {
            Ok(approved) => {
                info!(post_id = %post.id, approved, "manual approval answered");
                approved
            }
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "could not read approval, declining");
                false
            }
        }
    }
}
