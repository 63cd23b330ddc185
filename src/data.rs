//! Interaction data: reading raw event lists, splitting them into train
//! and test segments, and assembling left-padded training batches.
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use failure;
use rand::Rng;
use serde_json;

use models::StepInputs;
use {EntityId, ItemId};

/// Fills batch positions that hold no event, in every channel.
pub const PADDING: usize = 0;
/// Hour vocabulary: hours `1..=24` plus padding.
pub const HOUR_SIZE: usize = 25;
/// Weekday vocabulary: weekdays `1..=7` plus padding.
pub const WEEKDAY_SIZE: usize = 8;
/// Interval vocabulary: shifted intervals `1..=32` plus padding.
pub const INTERVAL_SIZE: usize = 33;

const MAX_RAW_INTERVAL: i64 = INTERVAL_SIZE as i64 - 2;

/// A single interaction with its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Item id, `>= 1`.
    pub item: ItemId,
    /// Day of week, `1..=7`.
    pub weekday: usize,
    /// Hour of day, `1..=24`.
    pub hour: usize,
    /// Interval bucket since the previous event.
    pub interval: usize,
}

impl Event {
    /// Build a new event.
    pub fn new(item: ItemId, weekday: usize, hour: usize, interval: usize) -> Self {
        Event {
            item: item,
            weekday: weekday,
            hour: hour,
            interval: interval,
        }
    }
}

/// Errors raised while reading raw events.
#[derive(Debug, Fail)]
pub enum DataError {
    /// The line is not a JSON list of `[item, weekday, hour, interval]` lists.
    #[fail(display = "Line {}: malformed event list: {}", line, message)]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parser message.
        message: String,
    },
    /// A field lies outside its domain.
    #[fail(
        display = "Line {}, event {}: {} value {} is out of range.",
        line, position, field, value
    )]
    OutOfRange {
        /// 1-based line number.
        line: usize,
        /// 0-based event position within the line.
        position: usize,
        /// Name of the offending field.
        field: &'static str,
        /// The offending value.
        value: i64,
    },
}

fn check_range(
    line: usize,
    position: usize,
    field: &'static str,
    value: i64,
    min: i64,
    max: i64,
) -> Result<usize, DataError> {
    if value < min || value > max {
        Err(DataError::OutOfRange {
            line: line,
            position: position,
            field: field,
            value: value,
        })
    } else {
        Ok(value as usize)
    }
}

/// Parse the events of one entity. `line` is the 1-based line number
/// reported in errors. Blank lines hold no events.
pub fn parse_line(line: usize, text: &str) -> Result<Vec<Event>, DataError> {
    let text = text.trim();

    if text.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<[i64; 4]> = serde_json::from_str(text).map_err(|error| DataError::Malformed {
        line: line,
        message: error.to_string(),
    })?;

    raw.iter()
        .enumerate()
        .map(|(position, &[item, weekday, hour, interval])| {
            Ok(Event {
                item: check_range(line, position, "item", item, 1, i64::max_value())?,
                weekday: check_range(line, position, "weekday", weekday, 1, 7)?,
                hour: check_range(line, position, "hour", hour, 1, 24)?,
                interval: check_range(line, position, "interval", interval, 0, MAX_RAW_INTERVAL)?,
            })
        })
        .collect()
}

/// Read a JSON-lines file holding one chronological event list per entity.
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<Event>>, failure::Error> {
    let reader = BufReader::new(File::open(path)?);
    let mut entities = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        entities.push(parse_line(idx + 1, &line?)?);
    }

    Ok(entities)
}

/// The four aligned channels of an event sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sequence {
    items: Vec<ItemId>,
    weekdays: Vec<usize>,
    hours: Vec<usize>,
    intervals: Vec<usize>,
}

impl Sequence {
    /// Channels of `events`, with every interval shifted up by one
    /// so that `0` stays free for padding.
    pub fn from_events(events: &[Event]) -> Self {
        Sequence {
            items: events.iter().map(|event| event.item).collect(),
            weekdays: events.iter().map(|event| event.weekday).collect(),
            hours: events.iter().map(|event| event.hour).collect(),
            intervals: events.iter().map(|event| event.interval + 1).collect(),
        }
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the sequence holds no events.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item channel.
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    /// Weekday channel.
    pub fn weekdays(&self) -> &[usize] {
        &self.weekdays
    }

    /// Hour channel.
    pub fn hours(&self) -> &[usize] {
        &self.hours
    }

    /// Shifted interval channel.
    pub fn intervals(&self) -> &[usize] {
        &self.intervals
    }

    /// Events in order, with their stored (shifted) intervals.
    pub fn events<'a>(&'a self) -> impl Iterator<Item = Event> + 'a {
        izip!(&self.items, &self.weekdays, &self.hours, &self.intervals)
            .map(|(&item, &weekday, &hour, &interval)| Event::new(item, weekday, hour, interval))
    }

    /// The event at `idx`, with its stored (shifted) interval.
    pub fn event(&self, idx: usize) -> Event {
        Event::new(
            self.items[idx],
            self.weekdays[idx],
            self.hours[idx],
            self.intervals[idx],
        )
    }

    /// The last `len` events.
    fn tail(&self, len: usize) -> Sequence {
        let start = self.len().saturating_sub(len);

        Sequence {
            items: self.items[start..].to_owned(),
            weekdays: self.weekdays[start..].to_owned(),
            hours: self.hours[start..].to_owned(),
            intervals: self.intervals[start..].to_owned(),
        }
    }
}

/// One entity's history, split in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    /// Events used for training and to warm up evaluation.
    pub train: Sequence,
    /// Held-out events that evaluation predicts.
    pub test: Sequence,
}

/// Length of the train segment of a sequence of `len` events.
///
/// A ratio of exactly `1.0` holds out the last event only.
pub fn split_point(split_ratio: f64, len: usize) -> usize {
    if split_ratio == 1.0 {
        len.saturating_sub(1)
    } else {
        ((split_ratio * len as f64) as usize).min(len)
    }
}

/// Per-entity train/test sequences.
#[derive(Clone, Debug)]
pub struct SequenceStore {
    num_items: usize,
    num_raw: usize,
    entities: BTreeMap<EntityId, Entity>,
}

impl SequenceStore {
    /// Split every raw event list at `split_ratio`. Entity ids are the
    /// positions in `raw`.
    ///
    /// With a `train_window`, train segments are cut to their last
    /// `train_window` events and entities whose train segment is shorter
    /// than that are left out.
    pub fn build(raw: &[Vec<Event>], split_ratio: f64, train_window: Option<usize>) -> Self {
        let num_items = raw
            .iter()
            .flat_map(|events| events.iter().map(|event| event.item))
            .max()
            .unwrap_or(0) + 1;

        let mut entities = BTreeMap::new();

        for (entity_id, events) in raw.iter().enumerate() {
            let (train, test) = events.split_at(split_point(split_ratio, events.len()));
            let mut train = Sequence::from_events(train);

            if let Some(window) = train_window {
                if train.len() < window {
                    continue;
                }
                train = train.tail(window);
            }

            entities.insert(
                entity_id,
                Entity {
                    train: train,
                    test: Sequence::from_events(test),
                },
            );
        }

        SequenceStore {
            num_items: num_items,
            num_raw: raw.len(),
            entities: entities,
        }
    }

    /// Number of item ids, padding included.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Number of retained entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity was retained.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of entities left out by the train window.
    pub fn num_skipped(&self) -> usize {
        self.num_raw - self.entities.len()
    }

    /// Look up an entity.
    pub fn get(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    /// Iterate over entities in id order.
    pub fn iter(&self) -> btree_map::Iter<EntityId, Entity> {
        self.entities.iter()
    }

    /// Shuffle the entity ids and chunk them into batches. The last batch
    /// may be smaller than `batch_size`.
    pub fn minibatches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<EntityId>> {
        let mut entity_ids: Vec<EntityId> = self.entities.keys().cloned().collect();
        rng.shuffle(&mut entity_ids);

        entity_ids
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_owned())
            .collect()
    }

    /// Left-pad the train segments of `entity_ids` to their longest length.
    /// Unknown ids contribute all-padding rows.
    pub fn assemble(&self, entity_ids: &[EntityId]) -> Batch {
        let sequences: Vec<Option<&Sequence>> = entity_ids
            .iter()
            .map(|entity_id| self.entities.get(entity_id).map(|entity| &entity.train))
            .collect();

        let width = sequences
            .iter()
            .map(|sequence| sequence.map_or(0, |sequence| sequence.len()))
            .max()
            .unwrap_or(0);

        Batch {
            entity_ids: entity_ids.to_owned(),
            items: Grid::left_padded(&sequences, width, Sequence::items),
            weekdays: Grid::left_padded(&sequences, width, Sequence::weekdays),
            hours: Grid::left_padded(&sequences, width, Sequence::hours),
            intervals: Grid::left_padded(&sequences, width, Sequence::intervals),
        }
    }
}

/// A `[rows, width]` grid of ids, stored column by column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    rows: usize,
    width: usize,
    data: Vec<usize>,
}

impl Grid {
    fn new(rows: usize, width: usize) -> Self {
        Grid {
            rows: rows,
            width: width,
            data: vec![PADDING; rows * width],
        }
    }

    fn left_padded(
        sequences: &[Option<&Sequence>],
        width: usize,
        channel: fn(&Sequence) -> &[usize],
    ) -> Self {
        let mut grid = Grid::new(sequences.len(), width);

        for (row, sequence) in sequences.iter().enumerate() {
            if let Some(sequence) = *sequence {
                let values = channel(sequence);
                let offset = width - values.len();

                for (col, &value) in values.iter().enumerate() {
                    grid.data[(offset + col) * grid.rows + row] = value;
                }
            }
        }

        grid
    }

    /// Value at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> usize {
        self.data[col * self.rows + row]
    }

    /// All rows at time step `col`.
    pub fn column(&self, col: usize) -> &[usize] {
        &self.data[col * self.rows..(col + 1) * self.rows]
    }

    /// One row across all time steps.
    pub fn row(&self, row: usize) -> Vec<usize> {
        (0..self.width).map(|col| self.get(row, col)).collect()
    }
}

/// Left-padded channels of a group of entities.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Entity of each row.
    pub entity_ids: Vec<EntityId>,
    /// Item channel.
    pub items: Grid,
    /// Weekday channel.
    pub weekdays: Grid,
    /// Hour channel.
    pub hours: Grid,
    /// Shifted interval channel.
    pub intervals: Grid,
}

impl Batch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    /// Number of time steps.
    pub fn width(&self) -> usize {
        self.items.width
    }

    /// Step inputs at time `t`.
    pub fn inputs(&self, t: usize) -> StepInputs {
        StepInputs {
            items: self.items.column(t),
            hours: self.hours.column(t),
            weekdays: self.weekdays.column(t),
            intervals: self.intervals.column(t),
        }
    }
}
