//! Per-session subscription state.
//!
//! A `ChannelSet` maps subscribed variable paths to their streaming options
//! and the accumulation state of the next outgoing frame. The producer
//! never decimates; every subscription keeps its own countdown so that two
//! sessions subscribed with the same options emit byte-identical frames.

use crate::codec;
use crate::registry::Variable;
use indexmap::IndexMap;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Encoding {
    Ascii,
    Base64,
}

impl Encoding {
    /// Wire tag carried in every data frame.
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            Encoding::Ascii => 0,
            Encoding::Base64 => 1,
        }
    }

    pub fn parse(token: &str) -> Option<Encoding> {
        match token {
            "ascii" => Some(Encoding::Ascii),
            "base64" => Some(Encoding::Base64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Samples per emitted frame.
    pub block_size: usize,
    /// Ticks per picked sample.
    pub decimation: usize,
    pub encoding: Encoding,
    /// Fractional digits for ASCII floats.
    pub precision: usize,
    /// Emit only when the value changed since the last emission.
    pub event_only: bool,
}

impl SubscriptionOptions {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.decimation < 1 {
            return Err("decimation must be >= 1");
        }
        if self.block_size < 1 {
            return Err("block size must be >= 1");
        }
        Ok(())
    }
}

/// One frame ready to go out on a data channel.
#[derive(Debug, Eq, PartialEq)]
pub struct DataFrame {
    pub wire_channel: u32,
    pub encoding_tag: u8,
    pub sample_count: u32,
    /// Monotonic tick index of the first sample in the frame.
    pub first_index: u64,
    pub payload: Vec<u8>,
}

pub struct Subscription {
    variable: Variable,
    wire_channel: u32,
    options: SubscriptionOptions,
    countdown: usize,
    /// Raw little-endian samples accumulated towards the next frame.
    block: Vec<u8>,
    block_count: usize,
    first_index: u64,
    last_emitted: Option<Vec<u8>>,
}

impl Subscription {
    fn new(variable: Variable, wire_channel: u32, options: SubscriptionOptions) -> Subscription {
        Subscription {
            variable,
            wire_channel,
            options,
            countdown: 1,
            block: Vec::new(),
            block_count: 0,
            first_index: 0,
            last_emitted: None,
        }
    }

    #[inline]
    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    #[inline]
    pub fn wire_channel(&self) -> u32 {
        self.wire_channel
    }

    #[inline]
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Offers one tick's sample to the subscription. Returns a frame when
    /// the block filled up, or immediately (flushing a partial block) for
    /// an event subscription whose value changed.
    pub fn offer(&mut self, tick: u64, sample: &[u8]) -> Option<DataFrame> {
        debug_assert_eq!(sample.len(), self.variable.byte_len());

        self.countdown -= 1;
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.options.decimation;

        if self.options.event_only {
            match &self.last_emitted {
                Some(last) if last.as_slice() == sample => return None,
                _ => {}
            }
            self.last_emitted = Some(sample.to_vec());
        }

        if self.block_count == 0 {
            self.first_index = tick;
        }

        self.block.extend_from_slice(sample);
        self.block_count += 1;

        // Events flush whatever has accumulated; periodic channels wait
        // for a full block.
        if self.options.event_only || self.block_count >= self.options.block_size {
            Some(self.take_frame())
        } else {
            None
        }
    }

    fn take_frame(&mut self) -> DataFrame {
        let payload = match self.options.encoding {
            Encoding::Ascii => {
                let mut text = String::new();
                for sample in self.block.chunks(self.variable.byte_len()) {
                    codec::format_ascii(&self.variable, sample, self.options.precision, &mut text);
                    text.push('\n');
                }
                text.into_bytes()
            }
            Encoding::Base64 => codec::encode_raw(&self.block).into_bytes(),
        };

        let frame = DataFrame {
            wire_channel: self.wire_channel,
            encoding_tag: self.options.encoding.tag(),
            sample_count: self.block_count as u32,
            first_index: self.first_index,
            payload,
        };

        self.block.clear();
        self.block_count = 0;

        frame
    }

    /// Drops any partially accumulated block. Used when the session's ring
    /// cursor had to be snapped forward.
    pub fn flush(&mut self) {
        self.block.clear();
        self.block_count = 0;
        self.countdown = 1;
    }
}

/// Ordered set of subscriptions, keyed by variable path.
pub struct ChannelSet {
    subscriptions: IndexMap<String, Subscription>,
    next_channel: u32,
}

impl ChannelSet {
    pub fn new() -> ChannelSet {
        ChannelSet {
            subscriptions: IndexMap::new(),
            // Channel 0 is the command channel; data channels start at 1.
            next_channel: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Adds or replaces a subscription, returning its wire channel id. A
    /// replaced subscription keeps the id assigned originally.
    pub fn subscribe(&mut self, variable: &Variable, options: SubscriptionOptions) -> u32 {
        let wire_channel = match self.subscriptions.get(&variable.path) {
            Some(existing) => existing.wire_channel,
            None => {
                let id = self.next_channel;
                self.next_channel += 1;
                id
            }
        };

        self.subscriptions.insert(
            variable.path.clone(),
            Subscription::new(variable.clone(), wire_channel, options),
        );

        wire_channel
    }

    pub fn unsubscribe(&mut self, path: &str) -> bool {
        self.subscriptions.shift_remove(path).is_some()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    #[inline]
    pub fn get(&self, path: &str) -> Option<&Subscription> {
        self.subscriptions.get(path)
    }

    /// Subscriptions whose variable belongs to the given sample-time, in
    /// subscription order.
    pub fn iter_sample_time(
        &mut self,
        sample_time: usize,
    ) -> impl Iterator<Item = &mut Subscription> {
        self.subscriptions
            .values_mut()
            .filter(move |sub| sub.variable.sample_time == sample_time)
    }

    /// Flushes all partial blocks (overrun recovery).
    pub fn flush_all(&mut self) {
        for sub in self.subscriptions.values_mut() {
            sub.flush();
        }
    }
}
