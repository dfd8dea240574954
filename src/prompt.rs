//! Interactive prompts.
//!
//! The run asks for a handful of values (drive choice, SSID, key, hostname,
//! password). [`Prompter`] abstracts the terminal: [`InquirePrompter`] is the
//! real one; unit tests replay canned answers through `ScriptedPrompter`.

use inquire::validator::Validation;
use inquire::{Confirm, Password, PasswordDisplayMode, Select, Text};
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
use crate::error::ProvisionError;
use crate::error::Result;

/// Input check run on every answer; `Err` carries the message shown to the user
pub type Validator = fn(&str) -> std::result::Result<(), String>;

pub trait Prompter {
    /// Free text, echoed.
    fn text(&self, message: &str, validator: Option<Validator>) -> Result<String>;

    /// Secret input; never echoed.
    fn secret(&self, message: &str, validator: Option<Validator>) -> Result<String>;

    /// Pick one of `options`, returning its index.
    fn select(&self, message: &str, options: &[String]) -> Result<usize>;

    fn confirm(&self, message: &str, default: bool) -> Result<bool>;
}

fn to_inquire(
    validator: Validator,
) -> impl Fn(&str) -> std::result::Result<Validation, inquire::CustomUserError> + Clone {
    move |input: &str| {
        Ok(match validator(input) {
            Ok(()) => Validation::Valid,
            Err(message) => Validation::Invalid(message.into()),
        })
    }
}

/// Terminal prompts via `inquire`
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    fn text(&self, message: &str, validator: Option<Validator>) -> Result<String> {
        let mut prompt = Text::new(message);
        if let Some(validator) = validator {
            prompt = prompt.with_validator(to_inquire(validator));
        }
        Ok(prompt.prompt()?.trim().to_string())
    }

    fn secret(&self, message: &str, validator: Option<Validator>) -> Result<String> {
        let mut prompt = Password::new(message)
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation();
        if let Some(validator) = validator {
            prompt = prompt.with_validator(to_inquire(validator));
        }
        Ok(prompt.prompt()?)
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        let choice = Select::new(message, options.to_vec())
            .with_starting_cursor(0)
            .without_filtering()
            .with_help_message("↑↓ to move, ENTER to select")
            .raw_prompt()?;
        Ok(choice.index)
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }
}

/// A canned answer for `ScriptedPrompter`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Text(String),
    Choice(usize),
    Confirm(bool),
}

#[cfg(test)]
impl Answer {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// Replays answers in order.
///
/// Answers rejected by a validator are recorded and skipped, the way a user
/// would be asked again.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: RefCell<VecDeque<Answer>>,
    asked: RefCell<Vec<String>>,
    rejected: RefCell<Vec<String>>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Every prompt message shown so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }

    /// Validation messages for rejected answers
    pub fn rejected(&self) -> Vec<String> {
        self.rejected.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.answers.borrow().len()
    }

    fn next(&self, message: &str) -> Result<Answer> {
        self.asked.borrow_mut().push(message.to_string());
        self.answers
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ProvisionError::prompt(format!("no scripted answer for `{}`", message)))
    }

    fn next_text(&self, message: &str, validator: Option<Validator>) -> Result<String> {
        loop {
            let value = match self.next(message)? {
                Answer::Text(value) => value,
                other => {
                    return Err(ProvisionError::prompt(format!(
                        "expected text for `{}`, got {:?}",
                        message, other
                    )));
                }
            };
            match validator.map_or(Ok(()), |v| v(&value)) {
                Ok(()) => return Ok(value),
                Err(reason) => self.rejected.borrow_mut().push(reason),
            }
        }
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn text(&self, message: &str, validator: Option<Validator>) -> Result<String> {
        self.next_text(message, validator)
    }

    fn secret(&self, message: &str, validator: Option<Validator>) -> Result<String> {
        self.next_text(message, validator)
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize> {
        match self.next(message)? {
            Answer::Choice(index) if index < options.len() => Ok(index),
            other => Err(ProvisionError::prompt(format!(
                "invalid choice {:?} for `{}` ({} options)",
                other,
                message,
                options.len()
            ))),
        }
    }

    fn confirm(&self, message: &str, _default: bool) -> Result<bool> {
        match self.next(message)? {
            Answer::Confirm(yes) => Ok(yes),
            other => Err(ProvisionError::prompt(format!(
                "expected yes/no for `{}`, got {:?}",
                message, other
            ))),
        }
    }
}
