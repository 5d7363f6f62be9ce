//! Temp table naming
//!
//! Names are `temp_<pipeline id>_<stage kind>_<digest><suffix>`, where the
//! digest covers the canonical form of every stage the table materializes.
//! Reissuing a name within one run appends `_1`, `_2`, ...

use docpipe_ir::{short_digest, PipelineId, Stage};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

const STAGE_DIGEST_WIDTH: usize = 8;

/// What a temp table is named after.
#[derive(Debug, Clone, Copy)]
pub enum NameSource<'a> {
    /// One stage, or a fused run of stages in pipeline order
    Stages(&'a [Stage]),
    /// The seed copy of a source relation
    Source(&'a str),
    /// Free-form label; the name gets a random suffix and is not reproducible
    Label(&'a str),
}

#[derive(Debug)]
pub struct TempTableNamer {
    pipeline_id: PipelineId,
    issued: HashMap<String, usize>,
}

impl TempTableNamer {
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            issued: HashMap::new(),
        }
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    pub fn name_for(&mut self, source: NameSource<'_>, suffix: &str) -> String {
        let (kind, digest) = match source {
            NameSource::Stages(stages) => {
                let kind = stages.first().map_or("empty", |stage| stage.kind().as_str());
                let canonical = Value::Array(stages.iter().map(Stage::canonical).collect());
                (kind, short_digest(canonical.to_string().as_bytes(), STAGE_DIGEST_WIDTH))
            }
            NameSource::Source(table) => ("source", short_digest(table.as_bytes(), STAGE_DIGEST_WIDTH)),
            NameSource::Label(label) => {
                let random = Uuid::new_v4().simple().to_string();
                return format!("temp_{}_{}{}", sanitize(label), &random[..12], suffix);
            }
        };

        let base = format!("temp_{}_{}_{}{}", self.pipeline_id, kind, digest, suffix);
        let count = self.issued.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base
        } else {
            format!("{}_{}", base, count)
        };
        *count += 1;
        name
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_ir::Pipeline;
    use serde_json::json;

    fn pipeline() -> Pipeline {
        Pipeline::parse(&json!([
            {"$match": {"a": 1}},
            {"$match": {"a": 1}},
            {"$unwind": "$tags"},
        ]))
        .unwrap()
    }

    #[test]
    fn test_name_shape() {
        let pipeline = pipeline();
        let mut namer = TempTableNamer::new(pipeline.id());
        let name = namer.name_for(NameSource::Stages(&pipeline.stages()[2..]), "");

        let prefix = format!("temp_{}_unwind_", pipeline.id());
        assert!(name.starts_with(&prefix), "{name}");
        assert_eq!(name.len(), prefix.len() + STAGE_DIGEST_WIDTH);
    }

    #[test]
    fn test_repeated_stage_gets_counter() {
        let pipeline = pipeline();
        let stages = pipeline.stages();
        let mut namer = TempTableNamer::new(pipeline.id());

        let first = namer.name_for(NameSource::Stages(&stages[0..1]), "");
        let second = namer.name_for(NameSource::Stages(&stages[1..2]), "");
        let third = namer.name_for(NameSource::Stages(&stages[0..1]), "");

        assert_eq!(second, format!("{first}_1"));
        assert_eq!(third, format!("{first}_2"));
    }

    #[test]
    fn test_suffix_is_part_of_the_base() {
        let pipeline = pipeline();
        let mut namer = TempTableNamer::new(pipeline.id());
        let stage = &pipeline.stages()[0..1];

        let plain = namer.name_for(NameSource::Stages(stage), "");
        let suffixed = namer.name_for(NameSource::Stages(stage), "_pre");
        assert_eq!(suffixed, format!("{plain}_pre"));
    }

    #[test]
    fn test_fresh_namers_agree() {
        let pipeline = pipeline();
        let run = || {
            let mut namer = TempTableNamer::new(pipeline.id());
            let mut names = vec![namer.name_for(NameSource::Source("users"), "")];
            for stage in pipeline.stages() {
                names.push(namer.name_for(NameSource::Stages(std::slice::from_ref(stage)), ""));
            }
            names
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fused_group_named_from_all_stages() {
        let a = Pipeline::parse(&json!([{"$unwind": "$x"}, {"$unwind": "$y"}])).unwrap();
        let b = Pipeline::parse(&json!([{"$unwind": "$x"}, {"$unwind": "$z"}])).unwrap();
        let id = a.id();

        let name_a = TempTableNamer::new(id.clone()).name_for(NameSource::Stages(a.stages()), "");
        let name_b = TempTableNamer::new(id).name_for(NameSource::Stages(b.stages()), "");
        assert_ne!(name_a, name_b);
    }

    #[test]
    fn test_label_names_are_random() {
        let mut namer = TempTableNamer::new(pipeline().id());
        let a = namer.name_for(NameSource::Label("my stage"), "");
        let b = namer.name_for(NameSource::Label("my stage"), "");
        assert!(a.starts_with("temp_my_stage_"));
        assert_ne!(a, b);
    }
}
