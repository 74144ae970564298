//! Cron-triggered program starts.
//!
//! Each enabled schedule owns one trigger loop task. The loop sleeps until
//! the next occurrence (or cancellation), starts the bound program, and
//! re-arms itself.

use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    error::{EntityKind, Error, Result},
    program::Program,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleView {
    pub name: String,
    pub spec: String,
    pub program: Option<String>,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// A parsed trigger specification.
///
/// Classic five-field cron lines use crontab numbering for the day of week
/// (0 or 7 = Sunday, 1 = Monday) and get a zero seconds field prepended. Six
/// and seven field lines and `@daily`-style shorthands are passed to the
/// `cron` crate as they are, with its own numbering (1 = Sunday).
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    spec: String,
    schedule: cron::Schedule,
}

impl TriggerSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSpec {
            spec: spec.to_string(),
            reason,
        };

        let trimmed = spec.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let expression = if !trimmed.starts_with('@') && fields.len() == 5 {
            let day_of_week = crontab_day_of_week(fields[4]).map_err(invalid)?;
            format!(
                "0 {} {} {} {} {day_of_week}",
                fields[0], fields[1], fields[2], fields[3]
            )
        } else {
            trimmed.to_string()
        };

        let schedule =
            cron::Schedule::from_str(&expression).map_err(|err| invalid(err.to_string()))?;

        Ok(Self {
            spec: spec.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }

    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedule.after(after).next()
    }
}

const DAY_NAMES: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// Rewrites a crontab day-of-week field (0-7, Sunday twice) as an explicit
/// list in the `cron` crate's 1-7 numbering. Lists, ranges, steps and day
/// names are expanded first.
fn crontab_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| format!("invalid day-of-week step '{step}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (crontab_day(first)?, crontab_day(last)?)
        } else {
            let day = crontab_day(range)?;
            // `3/2` runs from Wednesday to the end of the week.
            (day, if step.is_some() { 6 } else { day })
        };
        if first > last {
            return Err(format!("day-of-week range '{range}' is backwards"));
        }

        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days.insert(day % 7 + 1);
        }
    }

    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn crontab_day(value: &str) -> std::result::Result<u32, String> {
    if let Ok(day) = value.parse::<u32>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(format!("day of week {day} is out of range 0-7"))
        };
    }

    let lower = value.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| {
            // Three-letter abbreviation or the full name.
            (lower.len() == 3 || lower.len() == name.len()) && name.starts_with(lower.as_str())
        })
        .map(|index| index as u32)
        .ok_or_else(|| format!("unknown day of week '{value}'"))
}

struct TriggerLoop {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TriggerLoop {
    fn cancel(self) -> JoinHandle<()> {
        let _ = self.cancel.send(());
        self.task
    }
}

pub struct Schedule {
    name: String,
    trigger: TriggerSpec,
    program: Option<Arc<Program>>,
    enabled: bool,
    trigger_loop: Option<TriggerLoop>,
}

impl Schedule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &str {
        self.trigger.as_str()
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_armed(&self) -> bool {
        self.trigger_loop
            .as_ref()
            .is_some_and(|trigger_loop| !trigger_loop.task.is_finished())
    }

    pub fn config(&self) -> ScheduleConfig {
        ScheduleConfig {
            name: self.name.clone(),
            spec: self.trigger.as_str().to_string(),
            program: self.program.as_ref().map(|program| program.name().to_string()),
            enabled: self.enabled,
        }
    }

    pub fn view(&self, timezone: Tz) -> ScheduleView {
        let next_run = self
            .enabled
            .then(|| self.trigger.next_after(&Utc::now().with_timezone(&timezone)))
            .flatten()
            .map(|next| next.with_timezone(&Utc));

        ScheduleView {
            name: self.name.clone(),
            spec: self.trigger.as_str().to_string(),
            program: self.program.as_ref().map(|program| program.name().to_string()),
            enabled: self.enabled,
            next_run,
        }
    }

    /// Replaces any running loop with a fresh one armed from "now".
    fn arm(&mut self, timezone: Tz) {
        self.disarm();

        let Some(program) = self.program.clone() else {
            info!(schedule = %self.name, "schedule enabled without a program, nothing to trigger");
            return;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(trigger_loop(
            self.name.clone(),
            self.trigger.clone(),
            program,
            timezone,
            cancel_rx,
        ));
        self.trigger_loop = Some(TriggerLoop {
            cancel: cancel_tx,
            task,
        });
    }

    /// Cancels the loop only; the enabled flag is left untouched.
    fn disarm(&mut self) -> Option<JoinHandle<()>> {
        self.trigger_loop.take().map(TriggerLoop::cancel)
    }
}

async fn trigger_loop(
    name: String,
    trigger: TriggerSpec,
    program: Arc<Program>,
    timezone: Tz,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut after = Utc::now().with_timezone(&timezone);

    loop {
        let Some(next) = trigger.next_after(&after) else {
            warn!(schedule = %name, spec = trigger.as_str(), "schedule has no further occurrences");
            return;
        };

        let delay = next
            .with_timezone(&Utc)
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        info!(schedule = %name, program = program.name(), next = %next, "schedule armed");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut cancel => {
                info!(schedule = %name, "schedule canceled");
                return;
            }
        }

        info!(schedule = %name, program = program.name(), "schedule starting program");
        program.start();

        // Never compute from before the occurrence that just fired.
        let now = Utc::now().with_timezone(&timezone);
        after = if now > next { now } else { next };
    }
}

pub struct ScheduleRegistry {
    timezone: Tz,
    schedules: BTreeMap<String, Schedule>,
}

impl ScheduleRegistry {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            schedules: BTreeMap::new(),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schedules.contains_key(name)
    }

    /// `program` must already be resolved by the caller.
    pub fn add(&mut self, config: &ScheduleConfig, program: Option<Arc<Program>>) -> Result<()> {
        self.restore(config, program)?;
        if config.enabled {
            let timezone = self.timezone;
            if let Some(schedule) = self.schedules.get_mut(&config.name) {
                schedule.arm(timezone);
            }
        }
        Ok(())
    }

    /// Like [`add`](Self::add) but never arms the trigger loop, so it can run
    /// outside the runtime while a snapshot is being linked.
    pub fn restore(&mut self, config: &ScheduleConfig, program: Option<Arc<Program>>) -> Result<()> {
        if self.schedules.contains_key(&config.name) {
            return Err(Error::already_exists(EntityKind::Schedule, &config.name));
        }

        let trigger = TriggerSpec::parse(&config.spec)?;
        self.schedules.insert(
            config.name.clone(),
            Schedule {
                name: config.name.clone(),
                trigger,
                program,
                enabled: config.enabled,
                trigger_loop: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Schedule> {
        self.schedules
            .get(name)
            .ok_or_else(|| Error::not_found(EntityKind::Schedule, name))
    }

    /// Validation happens before anything is touched, so a rejected update
    /// leaves the schedule exactly as it was.
    pub fn set(
        &mut self,
        name: &str,
        config: &ScheduleConfig,
        program: Option<Arc<Program>>,
    ) -> Result<()> {
        let timezone = self.timezone;
        let schedule = self
            .schedules
            .get_mut(name)
            .ok_or_else(|| Error::not_found(EntityKind::Schedule, name))?;
        let trigger = TriggerSpec::parse(&config.spec)?;

        schedule.trigger = trigger;
        schedule.program = program;
        schedule.enabled = config.enabled;
        if schedule.enabled {
            schedule.arm(timezone);
        } else {
            schedule.disarm();
        }
        Ok(())
    }

    pub fn del(&mut self, name: &str) -> Result<()> {
        let mut schedule = self
            .schedules
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Schedule, name))?;
        schedule.disarm();
        Ok(())
    }

    /// Arms the loop of every schedule flagged as enabled.
    pub fn arm_enabled(&mut self) {
        let timezone = self.timezone;
        for schedule in self.schedules.values_mut().filter(|schedule| schedule.enabled) {
            schedule.arm(timezone);
        }
    }

    /// Cancels every trigger loop and waits until each one has exited.
    pub async fn disable_all(&mut self) {
        let tasks: Vec<_> = self
            .schedules
            .values_mut()
            .filter_map(Schedule::disarm)
            .collect();

        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "schedule loop ended abnormally");
            }
        }
    }

    /// Name of the first schedule bound to `program`.
    pub fn program_user(&self, program: &str) -> Option<&str> {
        self.schedules
            .values()
            .find(|schedule| {
                schedule
                    .program
                    .as_ref()
                    .is_some_and(|bound| bound.name() == program)
            })
            .map(Schedule::name)
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schedule> {
        self.schedules.values()
    }

    pub fn configs(&self) -> Vec<ScheduleConfig> {
        self.iter().map(Schedule::config).collect()
    }

    pub fn views(&self) -> Vec<ScheduleView> {
        self.iter().map(|schedule| schedule.view(self.timezone)).collect()
    }
}
