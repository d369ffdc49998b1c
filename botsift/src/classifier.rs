// botsift/src/classifier.rs
//
// Bridge to the external classifier services. All three speak one line of
// ASCII per TCP connection:
//
//   scorer   ← "| mean:… var:… … errprop:…\n"   → "<float>"
//   learner  ← "<1|-1> | mean:… …\n"            (nothing read back)
//   labeler  ← "<user agent>\n"                  → "<0|1>"
//
// Every call is bounded by one timeout covering connect, write and read. Any
// failure is logged and returns None: classification is best-effort and never
// holds up statistics.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::ScorerConfig;
use crate::error::{EngineError, Result};
use crate::events::ClassLabel;
use crate::state::KeyState;
use crate::stats::{histogram_moments, Moments};

const MAX_REPLY: usize = 1024;

// ── Feature vector ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub diffs:      Moments,
    pub hour_diffs: Moments,
    pub hours:      Moments,
    pub poverr:     f64,   // pages / requests
    pub uacount:    f64,   // distinct recent user agents
    pub errprop:    f64,   // errors / requests
}

impl FeatureVector {
    /// Snapshot of `state`, or None until every distribution has statistics.
    pub fn from_state(state: &KeyState) -> Option<Self> {
        let diffs      = state.diffs.moments()?;
        let hour_diffs = state.hour_diffs.moments()?;
        let hours      = histogram_moments(&state.hours)?;

        let (poverr, uacount, errprop) = if state.requests == 0 {
            (1.0, 1.0, 0.0)
        } else {
            let r = state.requests as f64;
            (state.pages as f64 / r, state.user_agents.len() as f64, state.errors as f64 / r)
        };

        Some(Self { diffs, hour_diffs, hours, poverr, uacount, errprop })
    }

    /// Wire form, newline terminated.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (d, h, t) = (&self.diffs, &self.hour_diffs, &self.hours);
        write!(
            f,
            "| mean:{} var:{} skew:{} kurtosis:{} \
             hmean:{} hvar:{} hskew:{} hkurtosis:{} \
             htmean:{} htvar:{} htskew:{} htkurtosis:{} \
             poverr:{} uacount:{} errprop:{}",
            d.mean, d.var, d.skew, d.kurtosis,
            h.mean, h.var, h.skew, h.kurtosis,
            t.mean, t.var, t.skew, t.kurtosis,
            self.poverr, self.uacount, self.errprop,
        )
    }
}

// ── Bridge ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Classifier {
    scorer:  String,
    learner: Option<String>,
    labeler: Option<String>,
    timeout: Duration,
}

impl Classifier {
    pub fn new(scorer: impl Into<String>, timeout: Duration) -> Self {
        Self { scorer: scorer.into(), learner: None, labeler: None, timeout }
    }

    /// None when no scorer address is configured.
    pub fn from_config(cfg: &ScorerConfig) -> Option<Self> {
        let scorer = cfg.addr.clone()?;
        Some(Self {
            scorer,
            learner: cfg.learn_addr.clone(),
            labeler: cfg.label_addr.clone(),
            timeout: cfg.timeout(),
        })
    }

    pub fn with_learner(mut self, addr: impl Into<String>) -> Self {
        self.learner = Some(addr.into());
        self
    }

    pub fn with_labeler(mut self, addr: impl Into<String>) -> Self {
        self.labeler = Some(addr.into());
        self
    }

    /// Ask the scorer for a prediction.
    pub async fn score(&self, features: &FeatureVector) -> Option<f64> {
        let line = features.to_line();
        match self.round_trip("scorer", &self.scorer, line.as_bytes(), true).await {
            Ok(reply) => match parse_number(&reply) {
                Some(p) => {
                    debug!(prediction = p, "scored");
                    Some(p)
                }
                None => {
                    warn!("scorer returned non-numeric reply: {:?}", reply);
                    None
                }
            },
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Submit a labelled example to the learner. No reply is read.
    pub async fn teach(&self, label: ClassLabel, features: &FeatureVector) -> bool {
        let Some(addr) = self.learner.as_deref() else {
            return false;
        };
        let prefix = match label {
            ClassLabel::Bot     => "1",
            ClassLabel::Human   => "-1",
            ClassLabel::Unknown => return false,
        };
        let line = format!("{} {}", prefix, features.to_line());
        match self.round_trip("learner", addr, line.as_bytes(), false).await {
            Ok(_) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Ground-truth label for a user agent, when a label service is configured.
    pub async fn label_for(&self, user_agent: &str) -> Option<ClassLabel> {
        let addr = self.labeler.as_deref()?;
        let line = format!("{}\n", user_agent.replace(|c: char| c == '\r' || c == '\n', " "));
        let reply = match self.round_trip("labeler", addr, line.as_bytes(), true).await {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        match reply.trim().parse::<f64>() {
            Ok(v) if v.fract() == 0.0 => Some(ClassLabel::from_service(v as i64)),
            _ => {
                warn!("labeler returned non-integer reply: {:?}", reply);
                None
            }
        }
    }

    async fn round_trip(
        &self,
        service: &'static str,
        addr:    &str,
        request: &[u8],
        reply:   bool,
    ) -> Result<String> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(request).await?;
            stream.shutdown().await?;
            if !reply {
                return Ok::<_, std::io::Error>(String::new());
            }
            let mut buf = Vec::with_capacity(64);
            (&mut stream).take(MAX_REPLY as u64).read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(s))  => Ok(s),
            Ok(Err(e)) => Err(EngineError::unavailable(service, format!("{}: {}", addr, e))),
            Err(_)     => Err(EngineError::unavailable(
                service,
                format!("{}: no reply within {:?}", addr, self.timeout),
            )),
        }
    }
}

fn parse_number(reply: &str) -> Option<f64> {
    let token = reply.split_whitespace().next()?;
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Key, LogEvent};
    use tokio::net::TcpListener;

    fn state_with_deltas() -> KeyState {
        let mut st = KeyState::new();
        for (i, t) in [1000i64, 1500, 2300].iter().enumerate() {
            st.apply(
                i as i64 + 1,
                &LogEvent {
                    key:          Key::new("h", "1.2.3.4"),
                    hour:         10,
                    status_line:  "200".into(),
                    user_agent:   "ua".into(),
                    epoch_ms:     *t,
                    content_type: "text/html".into(),
                },
            );
        }
        st
    }

    /// One-shot TCP peer: records the request, answers with `reply`.
    async fn peer(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8(buf).unwrap()
        });
        (addr, handle)
    }

    #[test]
    fn needs_two_deltas() {
        let mut st = KeyState::new();
        assert!(FeatureVector::from_state(&st).is_none());
        st = state_with_deltas();
        let fv = FeatureVector::from_state(&st).unwrap();
        assert_eq!(fv.diffs.mean, 650.0);
        assert_eq!(fv.poverr, 1.0);
        assert_eq!(fv.uacount, 1.0);
        assert_eq!(fv.errprop, 0.0);
    }

    #[test]
    fn line_has_every_feature_in_order() {
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        let line = fv.to_line();
        assert!(line.starts_with("| mean:650 var:45000 skew:0 kurtosis:0 hmean:0 "));
        assert!(line.ends_with(" poverr:1 uacount:1 errprop:0\n"));
        let names: Vec<&str> = line
            .trim_start_matches("| ")
            .split_whitespace()
            .map(|kv| kv.split(':').next().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "mean", "var", "skew", "kurtosis", "hmean", "hvar", "hskew", "hkurtosis",
                "htmean", "htvar", "htskew", "htkurtosis", "poverr", "uacount", "errprop",
            ]
        );
    }

    #[tokio::test]
    async fn numeric_reply_is_a_prediction() {
        let (addr, peer) = peer("-0.75\n").await;
        let c = Classifier::new(addr, Duration::from_secs(2));
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        assert_eq!(c.score(&fv).await, Some(-0.75));
        let sent = peer.await.unwrap();
        assert_eq!(sent, fv.to_line());
    }

    #[tokio::test]
    async fn non_numeric_reply_is_no_prediction() {
        let (addr, _peer) = peer("ERR model not loaded").await;
        let c = Classifier::new(addr, Duration::from_secs(2));
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        assert_eq!(c.score(&fv).await, None);
    }

    #[tokio::test]
    async fn unreachable_scorer_is_no_prediction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let c = Classifier::new(addr, Duration::from_millis(500));
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        assert_eq!(c.score(&fv).await, None);
    }

    #[tokio::test]
    async fn hung_scorer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });
        let c = Classifier::new(addr, Duration::from_millis(150));
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        let started = std::time::Instant::now();
        assert_eq!(c.score(&fv).await, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn teach_prefixes_the_label() {
        let (addr, peer) = peer("").await;
        let c = Classifier::new("127.0.0.1:1", Duration::from_secs(2)).with_learner(addr);
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        assert!(c.teach(ClassLabel::Human, &fv).await);
        let sent = peer.await.unwrap();
        assert!(sent.starts_with("-1 | mean:"));
        assert!(sent.ends_with('\n'));
    }

    #[tokio::test]
    async fn teach_without_learner_is_a_no_op() {
        let c = Classifier::new("127.0.0.1:1", Duration::from_secs(1));
        let fv = FeatureVector::from_state(&state_with_deltas()).unwrap();
        assert!(!c.teach(ClassLabel::Bot, &fv).await);
    }

    #[tokio::test]
    async fn label_service_maps_integers() {
        let (addr, peer) = peer("1").await;
        let c = Classifier::new("127.0.0.1:1", Duration::from_secs(2)).with_labeler(addr);
        assert_eq!(c.label_for("Googlebot/2.1").await, Some(ClassLabel::Bot));
        assert_eq!(peer.await.unwrap(), "Googlebot/2.1\n");
    }
}
