//! Frame-side variable helpers.
//!
//! Every mutation here is a `get` followed by a `replace`; see the module
//! docs of [`crate::variables`] for the race that implies.

use super::handlers::{GetVariables, ReplaceVariables};
use super::scope::VariableOption;
use super::Variables;
use crate::client::FrameClient;
use crate::error::BridgeError;
use crate::utils::{defaults_deep, merge_deep, unset_path};

impl FrameClient {
    /// Reads the addressed variables. A failed read yields an empty mapping.
    pub async fn get_variables(&self, option: VariableOption) -> Result<Variables, BridgeError> {
        Ok(self.call(&GetVariables { option }).await?.unwrap_or_default())
    }

    pub async fn replace_variables(&self, option: VariableOption, variables: Variables) -> Result<(), BridgeError> {
        self.call(&ReplaceVariables { option, variables }).await?;
        Ok(())
    }

    /// Reads, applies `f`, writes back, and returns what was written.
    pub async fn update_variables_with<F>(&self, option: VariableOption, f: F) -> Result<Variables, BridgeError>
    where
        F: FnOnce(&mut Variables) + Send,
    {
        let mut variables = self.get_variables(option).await?;
        f(&mut variables);
        self.replace_variables(option, variables.clone()).await?;
        Ok(variables)
    }

    /// Deep-merges `variables` in; existing keys are overwritten.
    pub async fn insert_or_assign_variables(
        &self,
        option: VariableOption,
        variables: Variables,
    ) -> Result<Variables, BridgeError> {
        self.update_variables_with(option, move |current| merge_deep(current, variables))
            .await
    }

    /// Deep-merges `variables` in; existing keys are kept.
    pub async fn insert_variables(&self, option: VariableOption, variables: Variables) -> Result<Variables, BridgeError> {
        self.update_variables_with(option, move |current| defaults_deep(current, variables))
            .await
    }

    /// Removes the value at a dotted `path`. Returns whether anything was
    /// removed; nothing is written otherwise.
    pub async fn delete_variable(&self, option: VariableOption, path: &str) -> Result<bool, BridgeError> {
        let mut variables = self.get_variables(option).await?;
        if !unset_path(&mut variables, path) {
            return Ok(false);
        }
        self.replace_variables(option, variables).await?;
        Ok(true)
    }
}
