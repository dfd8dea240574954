//! Prompter that replays canned answers in order.

use std::cell::RefCell;
use std::collections::VecDeque;

use dephy_pi::error::{ProvisionError, Result};
use dephy_pi::prompt::{Prompter, Validator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Text(String),
    Choice(usize),
    Confirm(bool),
}

impl Answer {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// Answers rejected by a validator are skipped, as if the user were asked again.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: RefCell<VecDeque<Answer>>,
    asked: RefCell<Vec<String>>,
}

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
            let Answer::Text(value) = self.next(message)? else {
                return Err(ProvisionError::prompt(format!("expected text for `{}`", message)));
            };
            if validator.map_or(Ok(()), |v| v(&value)).is_ok() {
                return Ok(value);
            }
        }
    }
}

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
                "invalid choice {:?} for `{}`",
                other, message
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
