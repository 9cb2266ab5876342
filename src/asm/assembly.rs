//! A template catalog and the operations over it.

use super::AssemblyError;
use super::template::{Argument, Template};
use std::collections::HashMap;

/// Templates that share an opcode mask, bucketed by their fixed opcode bits.
#[derive(Debug)]
pub struct OpcodeMaskGroup {
    mask: u32,
    by_opcode: HashMap<u32, Vec<usize>>,
}

impl OpcodeMaskGroup {
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Serials of the templates whose opcode equals `opcode`, in catalog order.
    pub fn templates_for(&self, opcode: u32) -> &[usize] {
        self.by_opcode.get(&opcode).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Templates with the same number of fixed opcode bits.
#[derive(Debug)]
pub struct SpecificityGroup {
    specificity: u32,
    mask_groups: Vec<OpcodeMaskGroup>,
}

impl SpecificityGroup {
    pub fn specificity(&self) -> u32 {
        self.specificity
    }

    /// Mask groups in the order their first template appears in the catalog.
    pub fn mask_groups(&self) -> &[OpcodeMaskGroup] {
        &self.mask_groups
    }
}

/// An immutable instruction catalog.
#[derive(Debug)]
pub struct Assembly {
    templates: Vec<Template>,
    groups: Vec<SpecificityGroup>,
}

impl Assembly {
    /// Build a catalog, assigning serials in the given order.
    pub fn new(mut templates: Vec<Template>) -> Result<Self, AssemblyError> {
        for (serial, template) in templates.iter_mut().enumerate() {
            template.serial = serial;
            template.validate()?;
        }

        let mut groups: Vec<SpecificityGroup> = Vec::new();
        for template in &templates {
            let specificity = template.specificity();
            let gi = match groups.iter().position(|g| g.specificity == specificity) {
                Some(i) => i,
                None => {
                    groups.push(SpecificityGroup { specificity, mask_groups: Vec::new() });
                    groups.len() - 1
                }
            };
            let group = &mut groups[gi];
            let mask = template.opcode_mask();
            let mi = match group.mask_groups.iter().position(|m| m.mask == mask) {
                Some(i) => i,
                None => {
                    group.mask_groups.push(OpcodeMaskGroup { mask, by_opcode: HashMap::new() });
                    group.mask_groups.len() - 1
                }
            };
            let mask_group = &mut group.mask_groups[mi];
            mask_group
                .by_opcode
                .entry(template.opcode)
                .or_default()
                .push(template.serial);
        }
        // Stable sort keeps first-seen order among equal specificities.
        groups.sort_by(|a, b| b.specificity.cmp(&a.specificity));

        Ok(Self { templates, groups })
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn template(&self, serial: usize) -> &Template {
        &self.templates[serial]
    }

    /// Groups ordered from most to least specific.
    pub fn specificity_groups(&self) -> &[SpecificityGroup] {
        &self.groups
    }

    /// Whether `arguments` satisfies the template's arity, operand kinds,
    /// field ranges and constraints. Never fails; an unusable list is simply
    /// not legal.
    pub fn is_legal_argument_list(&self, template: &Template, arguments: &[Argument]) -> bool {
        if arguments.len() != template.fields.len() {
            return false;
        }
        let encodable = template
            .fields
            .iter()
            .zip(arguments)
            .all(|(field, arg)| field.encode(template.mnemonic, arg).is_ok());
        encodable && template.constraints.iter().all(|c| c.check(arguments))
    }

    /// Encode `arguments` with `template`.
    pub fn assemble(&self, template: &Template, arguments: &[Argument]) -> Result<u32, AssemblyError> {
        if arguments.len() != template.fields.len() {
            return Err(AssemblyError::ArgumentCount {
                mnemonic: template.mnemonic,
                expected: template.fields.len(),
                found: arguments.len(),
            });
        }
        let mut word = template.opcode;
        for (field, arg) in template.fields.iter().zip(arguments) {
            word |= field.encode(template.mnemonic, arg)?;
        }
        if !template.constraints.iter().all(|c| c.check(arguments)) {
            return Err(AssemblyError::IllegalArguments { mnemonic: template.mnemonic });
        }
        Ok(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::aarch64::{Insn, Reg};
    use crate::asm::template::{Constraint, OperandField};

    #[test]
    fn test_groups_are_ordered_by_specificity() {
        let assembly = Assembly::aarch64();
        let specificities: Vec<u32> =
            assembly.specificity_groups().iter().map(|g| g.specificity()).collect();
        let mut sorted = specificities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(specificities, sorted);
        assert_eq!(specificities[0], 32, "nop and ret fix every bit");
    }

    #[test]
    fn test_assemble_add() {
        let assembly = Assembly::aarch64();
        let word = assembly
            .assemble(
                assembly.template(Insn::AddReg as usize),
                &[Argument::Reg(Reg::X0), Argument::Reg(Reg::X1), Argument::Reg(Reg::X2)],
            )
            .unwrap();
        assert_eq!(word, 0x8B020020);
    }

    #[test]
    fn test_illegal_list_is_false_not_error() {
        let template = Template::new(
            "quad",
            0,
            vec![
                OperandField::gpr("a", 0),
                OperandField::unsigned("b", 5, 5, 1),
                OperandField::gpr("c", 10),
                OperandField::unsigned("d", 15, 5, 1),
            ],
        )
        .constrain(Constraint::Range { field: 1, min: 0, max: 7 })
        .constrain(Constraint::Range { field: 3, min: 0, max: 7 });
        let assembly = Assembly::new(vec![template]).unwrap();
        let args = [
            Argument::Reg(Reg::X1),
            Argument::Imm(20),
            Argument::Reg(Reg::X2),
            Argument::Imm(31),
        ];
        assert!(!assembly.is_legal_argument_list(assembly.template(0), &args));
        assert!(assembly.assemble(assembly.template(0), &args).is_err());
    }
}
