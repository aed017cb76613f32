//! Outbound delivery with bounded retries.

use futures_util::StreamExt;
use relay_channels::{MessageSender, OpenId};
use relay_llm::FragmentStream;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct Deliverer {
    sender: Arc<dyn MessageSender>,
    policy: DeliveryPolicy,
}

impl Deliverer {
    pub fn new(sender: Arc<dyn MessageSender>, policy: DeliveryPolicy) -> Self {
        Self { sender, policy }
    }

    /// Sends `text` to `recipient`, retrying transport errors and platform
    /// rejections. `false` when no attempt succeeded or there is nobody to
    /// send to.
    #[tracing::instrument(level = "info", skip_all, fields(recipient = ?recipient.map(OpenId::as_str)))]
    pub async fn deliver(&self, text: &str, recipient: Option<&OpenId>) -> bool {
        let Some(recipient) = recipient else {
            tracing::error!("no resolvable recipient; reply dropped");
            return false;
        };
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let remaining = max_attempts - attempt;
            match self.sender.send_text(recipient, text).await {
                Ok(receipt) if receipt.is_success() => {
                    tracing::info!(
                        %recipient,
                        attempt,
                        message_id = ?receipt.message_id.as_ref().map(|id| id.as_str()),
                        "reply delivered"
                    );
                    return true;
                }
                Ok(receipt) => {
                    tracing::warn!(
                        %recipient,
                        attempt,
                        remaining,
                        code = receipt.code,
                        msg = %receipt.msg,
                        "send rejected by platform"
                    );
                }
                Err(e) => {
                    tracing::warn!(%recipient, attempt, remaining, error = %e, "send failed");
                }
            }
            if remaining > 0 {
                tokio::time::sleep(self.policy.retry_interval).await;
            }
        }

        tracing::error!(%recipient, max_attempts, "reply not delivered");
        false
    }

    /// Forwards each non-empty fragment as its own message, one attempt per
    /// fragment. Returns how many were sent.
    #[tracing::instrument(level = "info", skip_all, fields(recipient = ?recipient.map(OpenId::as_str)))]
    pub async fn deliver_stream(
        &self,
        mut fragments: FragmentStream,
        recipient: Option<&OpenId>,
    ) -> usize {
        let Some(recipient) = recipient else {
            tracing::error!("no resolvable recipient; streamed reply dropped");
            return 0;
        };

        let mut sent = 0usize;
        while let Some(fragment) = fragments.next().await {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    tracing::warn!(%e, "fragment stream failed; stopping");
                    break;
                }
            };
            if fragment.trim().is_empty() {
                continue;
            }
            match self.sender.send_text(recipient, &fragment).await {
                Ok(receipt) if receipt.is_success() => sent += 1,
                Ok(receipt) => {
                    tracing::warn!(%recipient, code = receipt.code, msg = %receipt.msg, "fragment rejected");
                }
                Err(e) => tracing::warn!(%recipient, error = %e, "fragment send failed"),
            }
        }
        tracing::info!(%recipient, sent, "streamed reply finished");
        sent
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSender;
    use super::*;
    use tokio::time::Instant;

    fn deliverer(sender: Arc<ScriptedSender>) -> Deliverer {
        Deliverer::new(sender, DeliveryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_backoff() {
        let sender = Arc::new(ScriptedSender::new());
        sender.fail();
        sender.reject(230001);
        let recipient = OpenId::from("ou_1");

        let started = Instant::now();
        assert!(deliverer(sender.clone()).deliver("hi", Some(&recipient)).await);
        assert_eq!(sender.sent().len(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_failures() {
        let sender = Arc::new(ScriptedSender::new());
        for _ in 0..3 {
            sender.fail();
        }

        let started = Instant::now();
        assert!(
            !deliverer(sender.clone())
                .deliver("hi", Some(&OpenId::from("ou_1")))
                .await
        );
        assert_eq!(sender.sent().len(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn missing_recipient_makes_no_attempt() {
        let sender = Arc::new(ScriptedSender::new());
        assert!(!deliverer(sender.clone()).deliver("hi", None).await);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn stream_sends_each_non_empty_fragment_once() {
        let sender = Arc::new(ScriptedSender::new());
        sender.reject(230001);
        let fragments: Vec<relay_llm::Result<String>> = vec![
            Ok("one".to_string()),
            Ok(" ".to_string()),
            Ok("two".to_string()),
            Ok("three".to_string()),
        ];

        let sent = deliverer(sender.clone())
            .deliver_stream(
                futures_util::stream::iter(fragments).boxed(),
                Some(&OpenId::from("ou_1")),
            )
            .await;
        assert_eq!(sent, 2);
        let texts: Vec<String> = sender.sent().into_iter().map(|(_, text)| text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }
}
