//! Interactive multi-step plan assembly.
//!
//! The wizard collects a valid deployment through an ordered sequence of
//! steps, allowing backward navigation and cancellation at any point and
//! never advancing past invalid input. Step transitions and validation are
//! plain methods on the state machine; [`ConfigurationWizard::run`] drives
//! them against the presentation collaborator. Exactly one wizard may own
//! the interaction surface at a time.


use crate::model::{CollectedPlan, OsImage, Plan, PlanDraft, RebuildSubmission, SshKey};
use crate::ui::{Answer, Choice, UserInterface};

/// Flow variant the wizard is collecting for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WizardMode {
    /// Collect a full deployment: plan, image, duration, optional key.
    Create,
    /// Collect a reinstall for an existing instance: image and optional key;
    /// the plan is fixed.
    Rebuild,
}

/// Current step of the wizard.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WizardStep {
    /// Choosing a plan from the permitted catalogue.
    SelectPlan,
    /// Choosing an operating system image offered by the selected plan.
    SelectOs,
    /// Entering the deployment duration in hours.
    EnterDuration,
    /// Choosing an SSH key, or explicitly none. The terminal productive
    /// step.
    SelectSshKey,
    /// All fields collected.
    Done,
}

/// Terminal result of a wizard interaction.
#[derive(Clone, Debug, PartialEq)]
pub enum WizardOutcome {
    /// Every field was collected and validated.
    Completed(CollectedPlan),
    /// The interaction surface was dismissed before completion.
    Cancelled,
    /// The catalogue was inconsistent (for example a plan without OS
    /// images); not a user cancellation.
    Error {
        /// Description of the inconsistency.
        message: String,
    },
}

/// Backward-navigable plan collection state machine.
#[derive(Clone, Debug)]
pub struct ConfigurationWizard {
    mode: WizardMode,
    catalog: Vec<Plan>,
    ssh_keys: Vec<SshKey>,
    max_time: u64,
    draft: PlanDraft,
    step: WizardStep,
    resolution: Option<WizardOutcome>,
}

impl ConfigurationWizard {
    /// Starts a create flow over a permission-filtered catalogue.
    #[must_use]
    pub fn new_create(catalog: Vec<Plan>, ssh_keys: Vec<SshKey>, max_time: u64) -> Self {
        Self {
            mode: WizardMode::Create,
            catalog,
            ssh_keys,
            max_time,
            draft: PlanDraft::default(),
            step: WizardStep::SelectPlan,
            resolution: None,
        }
    }

    /// Pre-populates the draft (edit mode). The flow still begins at
    /// [`WizardStep::SelectPlan`] with the existing values offered as
    /// defaults.
    #[must_use]
    pub fn with_draft(mut self, draft: PlanDraft) -> Self {
        self.draft = draft;
        self
    }

    /// Starts a rebuild flow for the instance's fixed plan.
    #[must_use]
    pub fn new_rebuild(
        catalog: Vec<Plan>,
        ssh_keys: Vec<SshKey>,
        plan_id: impl Into<String>,
    ) -> Self {
        let mut wizard = Self {
            mode: WizardMode::Rebuild,
            catalog,
            ssh_keys,
            max_time: u64::MAX,
            draft: PlanDraft {
                plan_id: Some(plan_id.into()),
                ..PlanDraft::default()
            },
            step: WizardStep::SelectPlan,
            resolution: None,
        };
        wizard.enter_os_step();
        wizard
    }

    /// Current step.
    #[must_use]
    pub const fn step(&self) -> WizardStep {
        self.step
    }

    /// The draft collected so far.
    #[must_use]
    pub const fn draft(&self) -> &PlanDraft {
        &self.draft
    }

    /// The recorded terminal outcome, once one exists.
    #[must_use]
    pub const fn resolution(&self) -> Option<&WizardOutcome> {
        self.resolution.as_ref()
    }

    /// Plans offered at the first step.
    #[must_use]
    pub fn plan_options(&self) -> &[Plan] {
        &self.catalog
    }

    /// Operating system images of the selected plan. Empty until a plan is
    /// selected.
    #[must_use]
    pub fn os_images(&self) -> &[OsImage] {
        self.selected_plan().map_or(&[], |plan| plan.os.as_slice())
    }

    /// SSH keys offered at the final step (the explicit "none" option is the
    /// presentation layer's to append).
    #[must_use]
    pub fn ssh_key_options(&self) -> &[SshKey] {
        &self.ssh_keys
    }

    /// Selects the plan at `index` and advances to the OS step.
    ///
    /// A plan without a resolvable OS list terminates the wizard with an
    /// error outcome. Already collected downstream fields are kept so
    /// back-then-forward navigation is idempotent.
    pub fn select_plan(&mut self, index: usize) {
        if self.step != WizardStep::SelectPlan {
            return;
        }
        let Some(plan) = self.catalog.get(index) else {
            return;
        };
        self.draft.plan_id = Some(plan.id.clone());
        self.enter_os_step();
    }

    /// Selects the OS image at `index` and advances.
    pub fn select_os(&mut self, index: usize) {
        if self.step != WizardStep::SelectOs {
            return;
        }
        let Some(image_id) = self.os_images().get(index).map(|image| image.id.clone()) else {
            return;
        };
        self.draft.os_id = Some(image_id);
        self.step = match self.mode {
            WizardMode::Create => WizardStep::EnterDuration,
            WizardMode::Rebuild => WizardStep::SelectSshKey,
        };
    }

    /// Validates and records the duration, advancing on success.
    ///
    /// # Errors
    ///
    /// Returns the inline message to redisplay when `input` is not a
    /// positive integer within the permitted ceiling; the step does not
    /// advance.
    pub fn enter_duration(&mut self, input: &str) -> Result<(), String> {
        if self.step != WizardStep::EnterDuration {
            return Ok(());
        }
        let hours = validate_duration(input, self.max_time)?;
        self.draft.duration_hours = Some(hours);
        self.step = WizardStep::SelectSshKey;
        Ok(())
    }

    /// Records the SSH key selection (`None` for "no key") and completes the
    /// wizard.
    pub fn select_ssh_key(&mut self, index: Option<usize>) {
        if self.step != WizardStep::SelectSshKey {
            return;
        }
        match index {
            Some(position) => {
                let Some(key) = self.ssh_keys.get(position) else {
                    return;
                };
                self.draft.ssh_key_id = Some(key.id.clone());
            }
            None => self.draft.ssh_key_id = None,
        }
        self.step = WizardStep::Done;
        self.complete();
    }

    /// Moves to the immediately preceding step; a no-op at the first step of
    /// the flow. Collected fields are preserved.
    pub fn back(&mut self) {
        self.step = match (self.mode, self.step) {
            (WizardMode::Create, WizardStep::SelectOs) => WizardStep::SelectPlan,
            (_, WizardStep::EnterDuration) => WizardStep::SelectOs,
            (WizardMode::Create, WizardStep::SelectSshKey) => WizardStep::EnterDuration,
            (WizardMode::Rebuild, WizardStep::SelectSshKey) => WizardStep::SelectOs,
            (_, current) => current,
        };
    }

    /// Records a dismissal of the interaction surface.
    ///
    /// Completion is one-shot and wins races with dismissal: a dismissal
    /// arriving after the wizard completed does not overwrite the outcome.
    pub fn dismiss(&mut self) {
        self.resolve(WizardOutcome::Cancelled);
    }

    /// Drives the state machine against the presentation collaborator until
    /// a terminal outcome is recorded.
    pub async fn run<U: UserInterface>(mut self, ui: &U) -> WizardOutcome {
        loop {
            if self.resolution.is_some() {
                return self.resolution.take().unwrap_or(WizardOutcome::Cancelled);
            }
            match self.step {
                WizardStep::SelectPlan => {
                    let choices: Vec<Choice> =
                        self.catalog.iter().map(plan_choice).collect();
                    match ui.pick("Select a plan", &choices).await {
                        Answer::Value(index) => self.select_plan(index),
                        Answer::Back => self.back(),
                        Answer::Dismissed => self.dismiss(),
                    }
                }
                WizardStep::SelectOs => {
                    let choices: Vec<Choice> = self
                        .os_images()
                        .iter()
                        .map(|image| Choice::new(display_name(&image.name, &image.id)))
                        .collect();
                    match ui.pick("Select an operating system", &choices).await {
                        Answer::Value(index) => self.select_os(index),
                        Answer::Back => self.back(),
                        Answer::Dismissed => self.dismiss(),
                    }
                }
                WizardStep::EnterDuration => {
                    let initial = self.draft.duration_hours.map(|hours| hours.to_string());
                    let max_time = self.max_time;
                    let validator =
                        move |input: &str| validate_duration(input, max_time).err();
                    match ui
                        .input("Duration in hours", initial.as_deref(), &validator)
                        .await
                    {
                        Answer::Value(text) => {
                            // Revalidated here; an invalid answer stays on
                            // this step and the loop redisplays it.
                            let _ = self.enter_duration(&text);
                        }
                        Answer::Back => self.back(),
                        Answer::Dismissed => self.dismiss(),
                    }
                }
                WizardStep::SelectSshKey => {
                    let mut choices: Vec<Choice> = self
                        .ssh_keys
                        .iter()
                        .map(|key| Choice::new(key.name.clone()))
                        .collect();
                    choices.push(Choice::new("Do not use an SSH key"));
                    let none_index = self.ssh_keys.len();
                    match ui.pick("Select an SSH key", &choices).await {
                        Answer::Value(index) if index == none_index => {
                            self.select_ssh_key(None);
                        }
                        Answer::Value(index) => self.select_ssh_key(Some(index)),
                        Answer::Back => self.back(),
                        Answer::Dismissed => self.dismiss(),
                    }
                }
                WizardStep::Done => {
                    self.complete();
                }
            }
        }
    }

    fn selected_plan(&self) -> Option<&Plan> {
        let plan_id = self.draft.plan_id.as_deref()?;
        self.catalog.iter().find(|plan| plan.id == plan_id)
    }

    fn enter_os_step(&mut self) {
        if self.os_images().is_empty() {
            let plan_id = self.draft.plan_id.clone().unwrap_or_default();
            self.resolve(WizardOutcome::Error {
                message: format!("plan {plan_id} offers no operating system images"),
            });
            return;
        }
        self.step = WizardStep::SelectOs;
    }

    fn complete(&mut self) {
        let collected = match self.mode {
            WizardMode::Create => self
                .draft
                .clone()
                .into_submission(self.max_time)
                .map(CollectedPlan::Create),
            WizardMode::Rebuild => match self.draft.os_id.clone() {
                Some(os_id) => Ok(CollectedPlan::Rebuild(RebuildSubmission {
                    os_id,
                    ssh_key_id: self.draft.ssh_key_id.clone(),
                })),
                None => Err(crate::model::DraftError::Missing("os")),
            },
        };
        match collected {
            Ok(plan) => self.resolve(WizardOutcome::Completed(plan)),
            Err(err) => self.resolve(WizardOutcome::Error {
                message: err.to_string(),
            }),
        }
    }

    fn resolve(&mut self, outcome: WizardOutcome) {
        if self.resolution.is_none() {
            self.resolution = Some(outcome);
        }
    }
}

/// Validates a duration entry against the permitted ceiling.
///
/// Accepts exactly the strings that are a positive integer with no
/// fractional part and no more than `max_time` hours.
///
/// # Errors
///
/// Returns the inline message to show next to the input field.
pub fn validate_duration(input: &str, max_time: u64) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(String::from("enter a positive whole number of hours"));
    }
    let hours: u64 = trimmed
        .parse()
        .map_err(|_| String::from("enter a positive whole number of hours"))?;
    if hours == 0 {
        return Err(String::from("enter a positive whole number of hours"));
    }
    if hours > max_time {
        return Err(format!("duration may be at most {max_time} hours"));
    }
    Ok(hours)
}

fn plan_choice(plan: &Plan) -> Choice {
    let mut parts = Vec::new();
    if let Some(cpu) = plan.cpu {
        parts.push(format!("{cpu} vCPU"));
    }
    if let Some(memory) = plan.memory_mb {
        parts.push(format!("{memory} MiB"));
    }
    if let Some(disk) = plan.disk_gb {
        parts.push(format!("{disk} GiB disk"));
    }
    let choice = Choice::new(plan.name.clone());
    if parts.is_empty() {
        choice
    } else {
        choice.with_detail(parts.join(" | "))
    }
}

fn display_name<'a>(name: &'a str, id: &'a str) -> &'a str {
    if name.is_empty() { id } else { name }
}
