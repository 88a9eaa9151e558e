//! Fixed instruction texts sent to the model. Kept as files under `prompts/`
//! so changes show up as plain-text diffs.

pub const PROPOSAL_EXTRACTION_PROMPT: &str = include_str!("../prompts/proposal_extraction.txt");

const RFP_STRUCTURING_TEMPLATE: &str = include_str!("../prompts/rfp_structuring.txt");
const INPUT_PLACEHOLDER: &str = "{{input}}";

/// The RFP structuring prompt with the buyer's text substituted in.
pub fn rfp_structuring_prompt(input: &str) -> String {
    RFP_STRUCTURING_TEMPLATE.replace(INPUT_PLACEHOLDER, input.trim())
}
