//! Stop-sequence detection over streamed text.

/// Where a stop sequence was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMatch {
    /// Byte offset of the first character of the stop sequence. Text before
    /// this offset is kept; everything from it on is discarded.
    pub index: usize,
    pub sequence: String,
}

/// Find the earliest stop sequence in `text`. When two sequences start at
/// the same offset the longer one is reported. Empty sequences never match.
pub fn detect_stop<S: AsRef<str>>(text: &str, stops: &[S]) -> Option<StopMatch> {
    let mut best: Option<StopMatch> = None;
    for stop in stops {
        let stop = stop.as_ref();
        if stop.is_empty() {
            continue;
        }
        if let Some(index) = text.find(stop) {
            let better = match &best {
                None => true,
                Some(b) => index < b.index || (index == b.index && stop.len() > b.sequence.len()),
            };
            if better {
                best = Some(StopMatch {
                    index,
                    sequence: stop.to_string(),
                });
            }
        }
    }
    best
}

/// Result of feeding one fragment to a [`StopScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Text that is safe to show. May be empty while a possible stop prefix
    /// is held back.
    Continue(String),
    /// A stop sequence completed. Carries the text preceding it that had not
    /// been emitted yet.
    Stopped { emit: String, sequence: String },
}

/// Incremental stop-sequence scanner.
///
/// Text that could be the beginning of a stop sequence is withheld until it
/// either completes the sequence or diverges, so consumers never see part of
/// a marker and generation can halt on the step the marker completes.
#[derive(Debug, Clone, Default)]
pub struct StopScanner {
    stops: Vec<String>,
    held: String,
    stopped: bool,
}

impl StopScanner {
    pub fn new<S: AsRef<str>>(stops: &[S]) -> Self {
        Self {
            stops: stops
                .iter()
                .map(|s| s.as_ref().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            held: String::new(),
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn push(&mut self, fragment: &str) -> ScanOutcome {
        if self.stopped {
            return ScanOutcome::Continue(String::new());
        }
        self.held.push_str(fragment);

        if let Some(m) = detect_stop(&self.held, &self.stops) {
            let emit = self.held[..m.index].to_string();
            self.held.clear();
            self.stopped = true;
            return ScanOutcome::Stopped {
                emit,
                sequence: m.sequence,
            };
        }

        let keep = self.partial_suffix_len();
        let split = self.held.len() - keep;
        let emit = self.held[..split].to_string();
        self.held.drain(..split);
        ScanOutcome::Continue(emit)
    }

    /// Release withheld text at the end of generation.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// Length of the longest suffix of the held text that is a proper
    /// prefix of some stop sequence.
    fn partial_suffix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            let max = stop.len().saturating_sub(1).min(self.held.len());
            for len in (longest + 1..=max).rev() {
                let start = self.held.len() - len;
                if !self.held.is_char_boundary(start) || !stop.is_char_boundary(len) {
                    continue;
                }
                if stop.starts_with(&self.held[start..]) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }
}
